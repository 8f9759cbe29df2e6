use anyhow::{anyhow, Result};
use trellis_core::store::{
    ACTIVATION_STATUS, CONTENT_NODE_TYPE, WORKSPACE_CONFIG, WORKSPACE_DAM, WORKSPACE_USERGROUPS,
    WORKSPACE_USERROLES, WORKSPACE_USERS, WORKSPACE_WEBSITE,
};
use trellis_core::{
    run_migration, AccessDefinition, AccessLevel, AclEntry, MemoryStore, MigrationError,
    MigrationResult, NodePath, NodeRoleRegistry, PropertyValue, RoleRegistry, RunStatus,
    StoreSession, TaskStatus, Version, Voter,
};
use trellis_travel_demo::pur;
use trellis_travel_demo::travel::{
    travel_demo_catalog, ADMINCENTRAL_ROLE, APP_LAUNCHER_GROUPS, CONTACTS_APP, EDITOR_ROLE,
    PAGES_APP, PUBLISHER_ROLE, SITE_DEFINITION, THEME, TRAVEL_SITE,
};

fn p(raw: &str) -> Result<NodePath> {
    Ok(NodePath::parse(raw)?)
}

fn group(name: &str) -> String {
    format!("{APP_LAUNCHER_GROUPS}/{name}")
}

/// Create an activated config node and its missing ancestors.
fn setup_config_node(store: &mut MemoryStore, path: &str) -> Result<()> {
    let path = p(path)?;
    store.ensure_path(WORKSPACE_CONFIG, &path, CONTENT_NODE_TYPE, CONTENT_NODE_TYPE)?;
    store.set_property(WORKSPACE_CONFIG, &path, ACTIVATION_STATUS, PropertyValue::Long(2))?;
    Ok(())
}

fn setup_config_property(
    store: &mut MemoryStore,
    path: &str,
    name: &str,
    value: &str,
) -> Result<()> {
    setup_config_node(store, path)?;
    store.set_property(WORKSPACE_CONFIG, &p(path)?, name, value.into())?;
    Ok(())
}

/// Config tree and system roles as a freshly bootstrapped instance has them.
fn fixture() -> Result<MemoryStore> {
    let mut store = MemoryStore::new();
    NodeRoleRegistry.create_role(&mut store, "superuser")?;
    NodeRoleRegistry.create_role(&mut store, pur::ANONYMOUS_ROLE)?;
    for path in [
        CONTACTS_APP.to_string(),
        group("stk"),
        group("manage"),
        group("target"),
        "/modules/ui-admincentral/virtualURIMapping/default".to_string(),
        "/modules/site/config".to_string(),
        "/server/filters/securityCallback/clientCallbacks/form".to_string(),
    ] {
        setup_config_node(&mut store, &path)?;
    }
    setup_config_property(&mut store, "/server", "admin", "true")?;
    store.save()?;
    Ok(store)
}

fn migrate(store: &mut MemoryStore, current: Option<&str>) -> Result<MigrationResult> {
    let catalog = travel_demo_catalog()?;
    let current = current.map(Version::parse).transpose()?;
    let result = run_migration(current, &catalog, store, &NodeRoleRegistry);
    if result.status != RunStatus::Committed {
        return Err(anyhow!("migration failed: {:?}", result.error));
    }
    Ok(result)
}

fn assert_no_messages(result: &MigrationResult) {
    assert!(
        result.warnings().next().is_none() && result.errors().next().is_none(),
        "unexpected messages: {:?}",
        result.messages
    );
}

fn assert_access(store: &MemoryStore, resource: &str, role: &str, voter: Voter) -> Result<()> {
    let definition = AccessDefinition::load(store, WORKSPACE_CONFIG, &p(resource)?)?;
    assert!(definition.lists(role, voter), "{resource} should list {role} as {voter:?}");
    Ok(())
}

fn assert_everything_activated(store: &MemoryStore) -> Result<()> {
    for (workspace, node_type) in [
        (WORKSPACE_WEBSITE, "mgnl:page"),
        (WORKSPACE_USERROLES, "mgnl:role"),
        (WORKSPACE_USERGROUPS, pur::GROUP_NODE_TYPE),
        (WORKSPACE_USERS, "mgnl:user"),
        (WORKSPACE_DAM, pur::ASSET_NODE_TYPE),
    ] {
        for node in store.descendants(workspace, &NodePath::root())? {
            if store.node_type(workspace, &node)? != node_type {
                continue;
            }
            assert_eq!(
                store.property(workspace, &node, ACTIVATION_STATUS)?,
                Some(PropertyValue::Long(2)),
                "{workspace}:{node} is not activated"
            );
        }
    }
    Ok(())
}

fn has_node(store: &MemoryStore, workspace: &str, path: &str) -> Result<bool> {
    Ok(store.node_exists(workspace, &p(path)?)?)
}

fn string_property(store: &MemoryStore, workspace: &str, path: &str, name: &str) -> Result<String> {
    store
        .string_property(workspace, &p(path)?, name)?
        .ok_or_else(|| anyhow!("{workspace}:{path} has no {name}"))
}

fn check_pur_samples_installed(store: &MemoryStore) -> Result<()> {
    assert!(has_node(store, WORKSPACE_WEBSITE, pur::MEMBERS_ROOT)?);
    assert!(has_node(store, WORKSPACE_WEBSITE, pur::PASSWORD_CHANGE_PAGE)?);
    for page in pur::PROTECTED_PAGES {
        assert!(has_node(store, WORKSPACE_WEBSITE, &format!("{}/{page}", pur::MEMBERS_ROOT))?);
    }

    assert!(NodeRoleRegistry.role_exists(store, pur::PUR_ROLE)?);
    assert!(has_node(store, WORKSPACE_USERGROUPS, &format!("/{}", pur::PUR_GROUP))?);
    assert!(has_node(store, WORKSPACE_DAM, pur::SAMPLE_ASSET)?);

    let callbacks = p(pur::CLIENT_CALLBACKS)?;
    assert_eq!(store.children(WORKSPACE_CONFIG, &callbacks)?, vec![pur::PUR_ROLE, "form"]);
    let pattern = string_property(
        store,
        WORKSPACE_CONFIG,
        &format!("{}/{}/originalUrlPattern", pur::CLIENT_CALLBACKS, pur::PUR_ROLE),
        "patternString",
    )?;
    assert_eq!(pattern, pur::CALLBACK_PATTERN);
    for page in pur::PROTECTED_PAGES {
        assert!(pattern.contains(page));
    }

    assert!(has_node(
        store,
        WORKSPACE_CONFIG,
        &format!("{TRAVEL_SITE}/templates/availability/templates/pur")
    )?);
    let pur_config = "/modules/public-user-registration/config/configurations/travel";
    assert_eq!(
        string_property(
            store,
            WORKSPACE_CONFIG,
            &format!("{pur_config}/passwordRetrievalStrategy"),
            "targetPagePath"
        )?,
        pur::PASSWORD_CHANGE_PAGE
    );
    assert_eq!(
        string_property(store, WORKSPACE_CONFIG, &format!("{pur_config}/defaultGroups"), "pur")?,
        pur::PUR_GROUP
    );

    for role in [pur::ANONYMOUS_ROLE, pur::PUR_ROLE] {
        let entries = NodeRoleRegistry.entries(store, role, "uri")?;
        assert_eq!(entries.len(), 2, "{role} uri entries");
        for entry in entries {
            assert!(pur::PROTECTED_URI_PATTERNS.contains(&entry.path.as_str()));
        }
    }
    assert!(NodeRoleRegistry
        .entries(store, pur::ANONYMOUS_ROLE, "uri")?
        .contains(&AclEntry::new("/travel/members/protected*", AccessLevel::None)));
    Ok(())
}

#[test]
fn update_from_0_7_sets_extends_on_empty_site_node() -> Result<()> {
    let mut store = fixture()?;
    store.ensure_path(
        WORKSPACE_CONFIG,
        &p(SITE_DEFINITION)?,
        CONTENT_NODE_TYPE,
        CONTENT_NODE_TYPE,
    )?;
    store.save()?;

    migrate(&mut store, Some("0.7"))?;
    assert_eq!(string_property(&store, WORKSPACE_CONFIG, SITE_DEFINITION, "extends")?, TRAVEL_SITE);

    let again = migrate(&mut store, Some("0.7"))?;
    let report = again
        .executed
        .iter()
        .find(|report| report.task == "site-extends")
        .ok_or_else(|| anyhow!("site-extends did not run"))?;
    assert_eq!(report.status, TaskStatus::Skipped);
    assert_eq!(string_property(&store, WORKSPACE_CONFIG, SITE_DEFINITION, "extends")?, TRAVEL_SITE);
    Ok(())
}

#[test]
fn update_from_0_7_keeps_a_configured_site_node() -> Result<()> {
    let mut store = fixture()?;
    setup_config_property(&mut store, SITE_DEFINITION, "templates", "custom")?;
    store.save()?;

    migrate(&mut store, Some("0.7"))?;
    assert_eq!(store.string_property(WORKSPACE_CONFIG, &p(SITE_DEFINITION)?, "extends")?, None);
    Ok(())
}

#[test]
fn update_from_0_7_allows_demo_roles_on_pages_app() -> Result<()> {
    let mut store = fixture()?;
    setup_config_node(&mut store, PAGES_APP)?;
    store.save()?;

    migrate(&mut store, Some("0.7"))?;

    let roles = format!("{PAGES_APP}/permissions/roles");
    assert_eq!(string_property(&store, WORKSPACE_CONFIG, &roles, EDITOR_ROLE)?, EDITOR_ROLE);
    assert_eq!(string_property(&store, WORKSPACE_CONFIG, &roles, PUBLISHER_ROLE)?, PUBLISHER_ROLE);
    Ok(())
}

#[test]
fn clean_install_sets_access_permissions() -> Result<()> {
    let mut store = fixture()?;

    let result = migrate(&mut store, None)?;
    assert_no_messages(&result);

    for resource in [CONTACTS_APP.to_string(), group("stk"), group("manage")] {
        assert_access(&store, &resource, ADMINCENTRAL_ROLE, Voter::Deny)?;
        let definition = AccessDefinition::load(&store, WORKSPACE_CONFIG, &p(&resource)?)?;
        assert!(!definition.is_granted(&[ADMINCENTRAL_ROLE]));
        assert!(definition.is_granted(&[EDITOR_ROLE]));
    }
    assert_access(&store, &group("target"), EDITOR_ROLE, Voter::Allow)?;
    assert_access(&store, &group("target"), PUBLISHER_ROLE, Voter::Allow)?;
    let target = AccessDefinition::load(&store, WORKSPACE_CONFIG, &p(&group("target"))?)?;
    assert!(!target.is_granted(&[ADMINCENTRAL_ROLE]));

    for role in [EDITOR_ROLE, PUBLISHER_ROLE, ADMINCENTRAL_ROLE] {
        assert!(NodeRoleRegistry.role_exists(&store, role)?);
    }
    Ok(())
}

#[test]
fn update_from_0_7_sets_denied_access_permissions() -> Result<()> {
    let mut store = fixture()?;

    migrate(&mut store, Some("0.7"))?;

    for resource in [CONTACTS_APP.to_string(), group("stk"), group("manage")] {
        assert_access(&store, &resource, ADMINCENTRAL_ROLE, Voter::Deny)?;
    }
    Ok(())
}

#[test]
fn update_from_0_8_sets_up_access_to_target_group() -> Result<()> {
    let mut store = fixture()?;

    let result = migrate(&mut store, Some("0.8"))?;

    assert_access(&store, &group("target"), EDITOR_ROLE, Voter::Allow)?;
    assert_access(&store, &group("target"), PUBLISHER_ROLE, Voter::Allow)?;
    assert!(result.executed.iter().all(|report| report.version > Version::new(0, 8, 0)));
    Ok(())
}

#[test]
fn upgrade_from_0_8_1_installs_pur_samples() -> Result<()> {
    let mut store = fixture()?;
    setup_config_property(&mut store, "/server", "admin", "false")?;
    setup_config_node(&mut store, "/modules/public-user-registration")?;
    setup_config_node(
        &mut store,
        "/modules/multisite/config/sites/travel/templates/availability/templates",
    )?;
    store.save()?;

    let result = migrate(&mut store, Some("0.8.1"))?;

    assert!(has_node(
        &store,
        WORKSPACE_CONFIG,
        "/modules/multisite/config/sites/travel/templates/availability/templates/pur"
    )?);
    check_pur_samples_installed(&store)?;
    assert_everything_activated(&store)?;
    assert_no_messages(&result);
    Ok(())
}

#[test]
fn upgrade_from_0_8_1_without_pur_installs_book_tour_only() -> Result<()> {
    let mut store = fixture()?;

    let result = migrate(&mut store, Some("0.8.1"))?;

    assert!(has_node(&store, WORKSPACE_WEBSITE, "/travel/book-tour")?);
    assert!(!has_node(&store, WORKSPACE_WEBSITE, pur::MEMBERS_ROOT)?);
    assert!(!NodeRoleRegistry.role_exists(&store, pur::PUR_ROLE)?);
    assert_everything_activated(&store)?;
    assert_no_messages(&result);
    Ok(())
}

#[test]
fn author_instance_skips_pur_samples() -> Result<()> {
    let mut store = fixture()?;
    setup_config_node(&mut store, "/modules/public-user-registration")?;
    store.save()?;

    let result = migrate(&mut store, Some("0.8.1"))?;

    assert!(!has_node(&store, WORKSPACE_WEBSITE, pur::MEMBERS_ROOT)?);
    let report = result
        .executed
        .iter()
        .find(|report| report.task == "pur-samples")
        .ok_or_else(|| anyhow!("pur-samples did not run"))?;
    assert_eq!(report.status, TaskStatus::Skipped);
    Ok(())
}

#[test]
fn upgrade_from_0_14_removes_theme() -> Result<()> {
    let mut store = fixture()?;
    setup_config_node(&mut store, THEME)?;
    store.save()?;

    let result = migrate(&mut store, Some("0.14"))?;

    assert!(!has_node(&store, WORKSPACE_CONFIG, THEME)?);
    assert!(has_node(&store, WORKSPACE_CONFIG, "/modules/site/config/themes")?);
    assert_everything_activated(&store)?;
    assert_no_messages(&result);
    Ok(())
}

#[test]
fn clean_install_on_public_instance_with_pur() -> Result<()> {
    let mut store = fixture()?;
    setup_config_node(&mut store, "/modules/public-user-registration")?;
    setup_config_node(&mut store, "/modules/multisite/config/sites/fallback")?;
    setup_config_property(&mut store, "/server", "admin", "false")?;
    store.save()?;

    let result = migrate(&mut store, None)?;

    assert!(has_node(
        &store,
        WORKSPACE_CONFIG,
        "/modules/multisite/config/sites/travel/templates/availability/templates/pur"
    )?);
    check_pur_samples_installed(&store)?;
    assert_everything_activated(&store)?;
    assert_no_messages(&result);
    assert_eq!(result.installed_version, Some(Version::parse("1.1")?));
    Ok(())
}

#[test]
fn running_the_full_catalog_twice_converges() -> Result<()> {
    let mut store = fixture()?;
    setup_config_node(&mut store, "/modules/public-user-registration")?;
    setup_config_property(&mut store, "/server", "admin", "false")?;
    setup_config_node(&mut store, SITE_DEFINITION)?;
    store.save()?;

    migrate(&mut store, None)?;
    let once = store.committed_snapshot();
    let again = migrate(&mut store, None)?;

    assert_eq!(store.committed_snapshot(), once);
    assert!(again.applied().next().is_none(), "re-run applied {:?}", again.executed);
    Ok(())
}

#[test]
fn unrecognized_installed_version_runs_nothing() -> Result<()> {
    let mut store = fixture()?;
    let before = store.committed_snapshot();
    let catalog = travel_demo_catalog()?;

    let result = run_migration(
        Some(Version::parse("0.6.5")?),
        &catalog,
        &mut store,
        &NodeRoleRegistry,
    );

    assert_eq!(result.status, RunStatus::Failed);
    assert!(matches!(result.error, Some(MigrationError::VersionUnrecognized { .. })));
    assert!(result.executed.is_empty());
    assert_eq!(store.committed_snapshot(), before);
    Ok(())
}

#[test]
fn missing_launcher_groups_are_reported_not_fatal() -> Result<()> {
    let mut store = MemoryStore::new();

    let result = migrate(&mut store, None)?;

    assert!(result.warnings().count() >= 3, "{:?}", result.messages);
    assert!(NodeRoleRegistry.role_exists(&store, EDITOR_ROLE)?);
    Ok(())
}
