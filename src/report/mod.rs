//! Compliance report generation.
//!
//! Invoked by the coordinator once both the quality and calculation streams
//! have arrived for a batch. Fetches both result artifacts, renders the
//! configured formats and writes each artifact back through the object
//! store gateway under `derived/{batch_id}/report.{ext}`.

mod renderers;

pub use renderers::{render_pdf, render_spreadsheet, render_xbrl};

use crate::errors::{CoreError, CoreResult};
use crate::events::{BatchCalculationCompleted, BatchQualityCompleted, ReportArtifact};
use crate::models::{ObjectRef, ReportFormat};
use crate::storage::ObjectStoreGateway;
use serde_json::Value;
use tracing::info;

/// Everything a renderer sees.
pub struct ReportContext<'a> {
    pub quality: &'a BatchQualityCompleted,
    pub calculation: &'a BatchCalculationCompleted,
    /// Parsed quality result artifact.
    pub quality_artifact: &'a Value,
    /// Parsed calculation result artifact.
    pub calculation_artifact: &'a Value,
}

#[derive(Clone)]
pub struct ReportGenerator {
    gateway: ObjectStoreGateway,
}

impl ReportGenerator {
    pub fn new(gateway: ObjectStoreGateway) -> Self {
        Self { gateway }
    }

    pub fn generate(
        &self,
        formats: &[ReportFormat],
        quality: &BatchQualityCompleted,
        calculation: &BatchCalculationCompleted,
    ) -> CoreResult<Vec<ReportArtifact>> {
        let quality_artifact = self.fetch_json(&quality.result_uri)?;
        let calculation_artifact = self.fetch_json(&calculation.result_uri)?;
        let ctx = ReportContext {
            quality,
            calculation,
            quality_artifact: &quality_artifact,
            calculation_artifact: &calculation_artifact,
        };

        let mut artifacts = Vec::with_capacity(formats.len());
        for format in formats {
            let (bytes, content_type) = match format {
                ReportFormat::Spreadsheet => {
                    (render_spreadsheet(&ctx)?, "text/csv")
                }
                ReportFormat::Xbrl => (render_xbrl(&ctx), "application/xml"),
                ReportFormat::Pdf => (render_pdf(&ctx), "application/pdf"),
            };
            let key = self
                .gateway
                .derived_key(&quality.batch_id, &format!("report.{}", format.extension()));
            let object_ref = self.gateway.put_derived(&key, &bytes, content_type)?;
            info!(batch_id = %quality.batch_id, format = format.as_str(), key = %object_ref.key,
                  "report artifact written");
            artifacts.push(ReportArtifact {
                format: format.as_str().to_string(),
                object_ref,
            });
        }
        Ok(artifacts)
    }

    fn fetch_json(&self, uri: &str) -> CoreResult<Value> {
        let object_ref = ObjectRef::from_uri(uri)
            .ok_or_else(|| CoreError::system(format!("bad result uri '{uri}'")))?;
        let bytes = self.gateway.get_object(&object_ref)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
