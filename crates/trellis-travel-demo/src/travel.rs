use trellis_core::store::{PAGE_NODE_TYPE, WORKSPACE_CONFIG, WORKSPACE_DAM, WORKSPACE_USERGROUPS};
use trellis_core::store::{WORKSPACE_USERROLES, WORKSPACE_USERS, WORKSPACE_WEBSITE};
use trellis_core::tasks::{
    ActivateTree, AddRolesToPermissions, CreateRole, InstallNodes, NodeSpec, ProvisionAccess,
    RemoveNode, SetPropertyIfEmpty, TaskGroup,
};
use trellis_core::{AccessRule, CatalogError, NodePath, TaskCatalog};

use crate::{pur, with_releases, LATEST_RELEASE};

pub const TRAVEL_DEMO_MODULE: &str = "travel-demo";

pub const EDITOR_ROLE: &str = "travel-demo-editor";
pub const PUBLISHER_ROLE: &str = "travel-demo-publisher";
pub const ADMINCENTRAL_ROLE: &str = "travel-demo-admincentral";

pub const SITE_DEFINITION: &str = "/modules/site/config/site";
pub const TRAVEL_SITE: &str = "/modules/travel-demo/config/travel";
pub const PAGES_APP: &str = "/modules/pages/apps/pages";
pub const CONTACTS_APP: &str = "/modules/contacts/apps/contacts";
pub const APP_LAUNCHER_GROUPS: &str = "/modules/ui-admincentral/config/appLauncherLayout/groups";
pub const THEME: &str = "/modules/site/config/themes/travel-demo-theme";

fn launcher_group(name: &str) -> Result<NodePath, CatalogError> {
    Ok(NodePath::parse(APP_LAUNCHER_GROUPS)?.child(name)?)
}

/// The travel demo module: roles, site wiring, app access, sample pages, and publication.
///
/// # Errors
/// Returns a [`CatalogError`] when a literal path or version is malformed.
pub fn travel_demo_catalog() -> Result<TaskCatalog, CatalogError> {
    let restrict_admincentral = vec![
        AccessRule::deny(NodePath::parse(CONTACTS_APP)?, ADMINCENTRAL_ROLE),
        AccessRule::deny(launcher_group("stk")?, ADMINCENTRAL_ROLE),
        AccessRule::deny(launcher_group("manage")?, ADMINCENTRAL_ROLE),
    ];
    let target_group = vec![
        AccessRule::allow(launcher_group("target")?, EDITOR_ROLE),
        AccessRule::allow(launcher_group("target")?, PUBLISHER_ROLE),
    ];

    with_releases(TaskCatalog::builder(TRAVEL_DEMO_MODULE, LATEST_RELEASE))
        .task(
            "0.8",
            TaskGroup::new("demo-roles", "Create the travel demo roles")
                .with(CreateRole::new("editor-role", "Create the editor role", EDITOR_ROLE))
                .with(CreateRole::new(
                    "publisher-role",
                    "Create the publisher role",
                    PUBLISHER_ROLE,
                ))
                .with(CreateRole::new(
                    "admincentral-role",
                    "Create the admin central role",
                    ADMINCENTRAL_ROLE,
                )),
        )
        .task(
            "0.8",
            SetPropertyIfEmpty::new(
                "site-extends",
                "Point an empty default site definition at the travel site",
                WORKSPACE_CONFIG,
                SITE_DEFINITION,
                "extends",
                TRAVEL_SITE,
            ),
        )
        .task(
            "0.8",
            AddRolesToPermissions::new(
                "pages-app-roles",
                "Allow demo editors and publishers to use the pages app",
                PAGES_APP,
                &[EDITOR_ROLE, PUBLISHER_ROLE],
            ),
        )
        .task(
            "0.8",
            ProvisionAccess::new(
                "restrict-admincentral",
                "Hide contacts and the stk/manage launcher groups from admin central users",
                restrict_admincentral,
            ),
        )
        .task(
            "0.8.1",
            ProvisionAccess::new(
                "target-group-access",
                "Allow demo editors and publishers to see the target launcher group",
                target_group,
            ),
        )
        .task(
            "0.9",
            InstallNodes::new(
                "book-tour-page",
                "Install the book-tour page",
                WORKSPACE_WEBSITE,
                vec![NodeSpec::new("/travel/book-tour", PAGE_NODE_TYPE)
                    .property("mgnl:template", "travel-demo:pages/book-tour")
                    .property("title", "Book a tour")
                    .activated()],
            ),
        )
        .task("0.9", pur::install_pur_samples())
        .task(
            "1.0",
            RemoveNode::new(
                "remove-theme",
                "Remove the travel demo theme from the config tree",
                WORKSPACE_CONFIG,
                THEME,
            ),
        )
        .task(
            "1.1",
            TaskGroup::new("publish-content", "Publish all demo content")
                .with(ActivateTree::new(
                    "publish-pages",
                    "Publish pages",
                    WORKSPACE_WEBSITE,
                    "/",
                    Some(PAGE_NODE_TYPE),
                ))
                .with(ActivateTree::new(
                    "publish-roles",
                    "Publish roles",
                    WORKSPACE_USERROLES,
                    "/",
                    Some("mgnl:role"),
                ))
                .with(ActivateTree::new(
                    "publish-groups",
                    "Publish groups",
                    WORKSPACE_USERGROUPS,
                    "/",
                    Some(pur::GROUP_NODE_TYPE),
                ))
                .with(ActivateTree::new(
                    "publish-users",
                    "Publish users",
                    WORKSPACE_USERS,
                    "/",
                    Some("mgnl:user"),
                ))
                .with(ActivateTree::new(
                    "publish-assets",
                    "Publish assets",
                    WORKSPACE_DAM,
                    "/",
                    Some(pur::ASSET_NODE_TYPE),
                )),
        )
        .build()
}
