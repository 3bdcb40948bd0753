//! Page annotation overlays.
//!
//! Highlights every visible clickable and numbers the ones without a
//! textual identifier so the vision model and the click resolver can
//! refer to them. Annotation is idempotent: a fresh pass always clears
//! the previous one first (the page script starts with the cleanup).

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::errors::BrowserError;

use super::transport::PageTransport;

const ANNOTATE_SCRIPT: &str = include_str!("scripts/annotate.js");
const CLEAR_SCRIPT: &str = include_str!("scripts/clear_annotations.js");
const INVENTORY_SCRIPT: &str = include_str!("scripts/inventory.js");

/// Census entry for one annotated element.
#[derive(Clone, Debug, Deserialize)]
pub struct AnnotatedElement {
    pub tag: String,
    pub text: String,
    /// Badge number for elements without a textual identifier.
    pub label: Option<u32>,
}

/// Summary returned by an annotation pass.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct AnnotationSummary {
    pub highlighted: u32,
    pub labeled: u32,
}

pub struct Annotator {
    transport: Arc<dyn PageTransport>,
}

impl Annotator {
    pub fn new(transport: Arc<dyn PageTransport>) -> Self {
        Self { transport }
    }

    pub async fn annotate(&self) -> Result<AnnotationSummary, BrowserError> {
        let summary: AnnotationSummary = self.eval_json(ANNOTATE_SCRIPT).await?;
        debug!(
            highlighted = summary.highlighted,
            labeled = summary.labeled,
            "page annotated"
        );
        Ok(summary)
    }

    pub async fn clear(&self) -> Result<(), BrowserError> {
        let _: serde_json::Value = self.eval_json(CLEAR_SCRIPT).await?;
        Ok(())
    }

    pub async fn inventory(&self) -> Result<Vec<AnnotatedElement>, BrowserError> {
        self.eval_json(INVENTORY_SCRIPT).await
    }

    async fn eval_json<T: serde::de::DeserializeOwned>(
        &self,
        script: &str,
    ) -> Result<T, BrowserError> {
        let response = self
            .transport
            .command(
                "Runtime.evaluate",
                json!({
                    "expression": format!("({script})()"),
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;

        if let Some(details) = response.get("exceptionDetails") {
            return Err(BrowserError::ScriptFailed(details.to_string()));
        }

        let raw = response["result"]["value"]
            .as_str()
            .ok_or_else(|| BrowserError::ScriptFailed("annotation script returned no value".into()))?;
        serde_json::from_str(raw)
            .map_err(|err| BrowserError::ScriptFailed(format!("annotation payload invalid: {err}")))
    }
}
