use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{action::BrowserAction, error::BrowserError};

pub const BLANK_PAGE: &str = "about:blank";

/// Snapshot of browser state. The accessibility tree is opaque text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowserObservation {
    pub url: String,
    pub title: String,
    pub accessibility_tree: String,
}

impl BrowserObservation {
    pub fn new(
        url: impl Into<String>,
        title: impl Into<String>,
        accessibility_tree: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            accessibility_tree: accessibility_tree.into(),
        }
    }

    pub fn blank() -> Self {
        Self::new(BLANK_PAGE, "", "")
    }
}

/// Browser automation collaborator. Rendering, element lookup and process
/// lifecycle all live on the other side of this trait.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn goto(&self, url: &str) -> Result<BrowserObservation, BrowserError>;

    async fn execute_action(&self, action: &BrowserAction) -> Result<BrowserObservation, BrowserError>;
}
