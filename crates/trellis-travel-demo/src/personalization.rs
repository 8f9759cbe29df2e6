use trellis_core::store::{PAGE_NODE_TYPE, WORKSPACE_WEBSITE};
use trellis_core::tasks::{ActivateNodes, AddMixin, EnsureNode, GrantPermission, RemoveNode};
use trellis_core::{AccessLevel, AclEntry, CatalogError, TaskCatalog};

use crate::travel::ADMINCENTRAL_ROLE;
use crate::{with_releases, LATEST_RELEASE};

pub const PERSONALIZATION_MODULE: &str = "travel-demo-personalization";

pub const PERSONAS_WORKSPACE: &str = "personas";
pub const VARIANTS_NODE_TYPE: &str = "mgnl:variants";
pub const HAS_VARIANTS_MIXIN: &str = "mgnl:hasVariants";

pub const LEGACY_VARIANTS: &str = "/travel/variants";
pub const CONTACT_PAGE: &str = "/travel/contact";
pub const CONTACT_VARIANTS: &str = "/travel/contact/variants";

/// Personas access for admin central users and the contact page variants.
///
/// # Errors
/// Returns a [`CatalogError`] when a literal version is malformed.
pub fn personalization_catalog() -> Result<TaskCatalog, CatalogError> {
    with_releases(TaskCatalog::builder(PERSONALIZATION_MODULE, LATEST_RELEASE))
        .task(
            "0.8",
            GrantPermission::new(
                "personas-access",
                "Let admin central users manage personas",
                ADMINCENTRAL_ROLE,
                PERSONAS_WORKSPACE,
                vec![AclEntry::new("/*", AccessLevel::All)],
            ),
        )
        .task(
            "0.14",
            RemoveNode::new(
                "remove-travel-variants",
                "Remove variants that lived directly below the travel page",
                WORKSPACE_WEBSITE,
                LEGACY_VARIANTS,
            ),
        )
        .task(
            "0.14",
            EnsureNode::new(
                "contact-variants",
                "Install the contact page variants",
                WORKSPACE_WEBSITE,
                CONTACT_VARIANTS,
                VARIANTS_NODE_TYPE,
            )
            .with_intermediate_type(PAGE_NODE_TYPE),
        )
        .task(
            "0.14",
            AddMixin::new(
                "contact-has-variants",
                "Mark the contact page as having variants",
                WORKSPACE_WEBSITE,
                CONTACT_PAGE,
                HAS_VARIANTS_MIXIN,
            ),
        )
        .task(
            "0.14",
            ActivateNodes::new(
                "publish-contact-variants",
                "Publish the contact variants and their parent pages",
                WORKSPACE_WEBSITE,
                &[CONTACT_VARIANTS],
            ),
        )
        .build()
}
