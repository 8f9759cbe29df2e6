//! Public user registration samples: member pages, a login-protected area, and the role,
//! group, and security callback that guard it.
//!
//! Samples are only installed on public instances that have the registration module.

use trellis_core::store::{
    CONTENT_NODE_TYPE, PAGE_NODE_TYPE, WORKSPACE_CONFIG, WORKSPACE_DAM, WORKSPACE_USERGROUPS,
    WORKSPACE_WEBSITE,
};
use trellis_core::tasks::{
    Condition, Conditional, CreateRole, GrantPermission, InstallNodes, NodeSpec, OrderNode,
    Position,
};
use trellis_core::{AccessLevel, AclEntry};

pub const PUR_MODULE: &str = "public-user-registration";
pub const PUR_ROLE: &str = "travel-demo-pur";
pub const PUR_GROUP: &str = "travel-demo-pur";
pub const ANONYMOUS_ROLE: &str = "anonymous";

pub const GROUP_NODE_TYPE: &str = "mgnl:group";
pub const ASSET_NODE_TYPE: &str = "mgnl:asset";
pub const FOLDER_NODE_TYPE: &str = "mgnl:folder";

pub const MEMBERS_ROOT: &str = "/travel/members";
pub const PROTECTED_PAGES: [&str; 2] = ["protected", "profile-update"];
pub const PASSWORD_CHANGE_PAGE: &str = "/travel/members/password-change";
pub const PROTECTED_URI_PATTERNS: [&str; 2] =
    ["/travel/members/protected*", "/travel/members/profile-update*"];

pub const CLIENT_CALLBACKS: &str = "/server/filters/securityCallback/clientCallbacks";
pub const CALLBACK_PATTERN: &str = "(*|travel)/members/(profile-update|protected)*";
pub const SAMPLE_ASSET: &str = "/travel-demo/img/gate-hernan-pinera.jpg";
pub const MULTISITE_SITES: &str = "/modules/multisite/config/sites";

const PUR_CONFIG: &str = "/modules/public-user-registration/config/configurations/travel";
const AVAILABILITY: &str = "templates/availability/templates/pur";

fn member_pages() -> Vec<NodeSpec> {
    let page = |path: String, template: &str, title: &str| {
        NodeSpec::new(&path, PAGE_NODE_TYPE)
            .property("mgnl:template", template)
            .property("title", title)
            .activated()
    };
    vec![
        page(MEMBERS_ROOT.to_string(), "travel-demo:pages/standard", "Members"),
        page(format!("{MEMBERS_ROOT}/protected"), "travel-demo:pages/pur", "Members only"),
        page(format!("{MEMBERS_ROOT}/profile-update"), "travel-demo:pages/pur", "Update profile"),
        page(PASSWORD_CHANGE_PAGE.to_string(), "travel-demo:pages/pur", "Change password"),
    ]
}

fn uri_entries(permissions: AccessLevel) -> Vec<AclEntry> {
    PROTECTED_URI_PATTERNS.iter().map(|pattern| AclEntry::new(*pattern, permissions)).collect()
}

fn availability(site: &str) -> NodeSpec {
    NodeSpec::new(&format!("{site}/{AVAILABILITY}"), CONTENT_NODE_TYPE)
        .property("id", "travel-demo:pages/pur")
}

#[must_use]
pub fn install_pur_samples() -> Conditional {
    let callback = format!("{CLIENT_CALLBACKS}/{PUR_ROLE}");

    Conditional::new(
        "pur-samples",
        "Install public user registration samples on public instances",
        Condition::All(vec![
            Condition::module_installed(PUR_MODULE),
            Condition::not(Condition::AuthorInstance),
        ]),
    )
    .then(InstallNodes::new(
        "pur-pages",
        "Install member pages",
        WORKSPACE_WEBSITE,
        member_pages(),
    ))
    .then(CreateRole::new("pur-role", "Create the members role", PUR_ROLE))
    .then(InstallNodes::new(
        "pur-group",
        "Install the members group",
        WORKSPACE_USERGROUPS,
        vec![
            NodeSpec::new(&format!("/{PUR_GROUP}"), GROUP_NODE_TYPE).activated(),
            NodeSpec::new(&format!("/{PUR_GROUP}/roles"), CONTENT_NODE_TYPE)
                .property("0", PUR_ROLE),
        ],
    ))
    .then(GrantPermission::new(
        "pur-anonymous-uri",
        "Keep anonymous visitors out of the member area",
        ANONYMOUS_ROLE,
        "uri",
        uri_entries(AccessLevel::None),
    ))
    .then(GrantPermission::new(
        "pur-member-uri",
        "Let members read the member area",
        PUR_ROLE,
        "uri",
        uri_entries(AccessLevel::Read),
    ))
    .then(InstallNodes::new(
        "pur-assets",
        "Install the member area image",
        WORKSPACE_DAM,
        vec![
            NodeSpec::new("/travel-demo", FOLDER_NODE_TYPE),
            NodeSpec::new("/travel-demo/img", FOLDER_NODE_TYPE),
            NodeSpec::new(SAMPLE_ASSET, ASSET_NODE_TYPE)
                .property("type", "jpg")
                .activated(),
        ],
    ))
    .then(InstallNodes::new(
        "pur-callback",
        "Send unauthenticated member requests to the login form",
        WORKSPACE_CONFIG,
        vec![
            NodeSpec::new(&callback, CONTENT_NODE_TYPE).property("loginForm", "/travel/members"),
            NodeSpec::new(&format!("{callback}/originalUrlPattern"), CONTENT_NODE_TYPE)
                .property("patternString", CALLBACK_PATTERN),
        ],
    ))
    .then(OrderNode::new(
        "pur-callback-first",
        "Evaluate the member callback before the others",
        WORKSPACE_CONFIG,
        &callback,
        Position::First,
    ))
    .then(InstallNodes::new(
        "pur-config",
        "Configure registration for the travel site",
        WORKSPACE_CONFIG,
        vec![
            availability(crate::travel::TRAVEL_SITE),
            NodeSpec::new(&format!("{PUR_CONFIG}/passwordRetrievalStrategy"), CONTENT_NODE_TYPE)
                .property("targetPagePath", PASSWORD_CHANGE_PAGE),
            NodeSpec::new(&format!("{PUR_CONFIG}/defaultGroups"), CONTENT_NODE_TYPE)
                .property("pur", PUR_GROUP),
        ],
    ))
    .then(
        Conditional::new(
            "pur-multisite",
            "Make the member template available on the multisite travel site",
            Condition::node_exists(WORKSPACE_CONFIG, MULTISITE_SITES),
        )
        .then(InstallNodes::new(
            "pur-multisite-availability",
            "Register the member template for the multisite travel site",
            WORKSPACE_CONFIG,
            vec![availability(&format!("{MULTISITE_SITES}/travel"))],
        )),
    )
}
