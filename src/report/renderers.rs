//! Report renderers: CSV spreadsheet, XBRL-flavoured XML and a minimal
//! single-page PDF.

use super::ReportContext;
use crate::errors::{CoreError, CoreResult};

/// CSV summary: one key/value section per result stream plus the dimension
/// scores.
pub fn render_spreadsheet(ctx: &ReportContext<'_>) -> CoreResult<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());

    writer
        .write_record(["section", "key", "value"])
        .map_err(|e| CoreError::system(format!("csv write: {e}")))?;

    let rows = summary_rows(ctx);
    for (section, key, value) in rows {
        writer
            .write_record([section, &key, &value])
            .map_err(|e| CoreError::system(format!("csv write: {e}")))?;
    }

    writer
        .into_inner()
        .map_err(|e| CoreError::system(format!("csv flush: {e}")))
}

/// XBRL-flavoured XML instance with one fact per summary value.
pub fn render_xbrl(ctx: &ReportContext<'_>) -> Vec<u8> {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str("<xbrli:xbrl xmlns:xbrli=\"http://www.xbrl.org/2003/instance\" xmlns:lex=\"urn:regflow:large-exposures\">\n");
    xml.push_str(&format!(
        "  <xbrli:context id=\"batch\"><xbrli:entity><xbrli:identifier scheme=\"urn:regflow:bank\">{}</xbrli:identifier></xbrli:entity></xbrli:context>\n",
        escape_xml(&ctx.quality.bank_id)
    ));
    for (section, key, value) in summary_rows(ctx) {
        xml.push_str(&format!(
            "  <lex:{section}.{key} contextRef=\"batch\">{}</lex:{section}.{key}>\n",
            escape_xml(&value),
        ));
    }
    xml.push_str("</xbrli:xbrl>\n");
    xml.into_bytes()
}

/// Minimal one-page PDF carrying the summary lines as text. Structured
/// readers belong on the CSV/XBRL artifacts; this exists for sign-off
/// workflows that require a document.
pub fn render_pdf(ctx: &ReportContext<'_>) -> Vec<u8> {
    let mut lines = vec![
        "Large Exposures Compliance Report".to_string(),
        format!("Batch: {}", ctx.quality.batch_id),
        format!("Bank: {}", ctx.quality.bank_id),
        format!(
            "Quality grade: {} (overall {})",
            ctx.quality.quality_scores.grade.as_str(),
            ctx.quality.quality_scores.overall_score
        ),
        format!(
            "Total exposures: {}  Total EUR: {}",
            ctx.calculation.total_exposures, ctx.calculation.total_amount_eur
        ),
    ];
    for (dimension, score) in &ctx.quality.quality_scores.dimension_scores {
        lines.push(format!("  {dimension}: {score}"));
    }

    // Content stream: one text line per summary row.
    let mut content = String::from("BT\n/F1 11 Tf\n14 TL\n50 780 Td\n");
    for line in &lines {
        content.push_str(&format!("({}) Tj\nT*\n", escape_pdf(line)));
    }
    content.push_str("ET\n");

    let objects = [
        "<< /Type /Catalog /Pages 2 0 R >>".to_string(),
        "<< /Type /Pages /Kids [3 0 R] /Count 1 >>".to_string(),
        "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 595 842] /Contents 4 0 R /Resources << /Font << /F1 5 0 R >> >> >>".to_string(),
        format!("<< /Length {} >>\nstream\n{content}endstream", content.len()),
        "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_string(),
    ];

    let mut pdf = String::from("%PDF-1.4\n");
    let mut offsets = Vec::with_capacity(objects.len());
    for (i, body) in objects.iter().enumerate() {
        offsets.push(pdf.len());
        pdf.push_str(&format!("{} 0 obj\n{body}\nendobj\n", i + 1));
    }
    let xref_offset = pdf.len();
    pdf.push_str(&format!("xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1));
    for offset in &offsets {
        pdf.push_str(&format!("{offset:010} 00000 n \n"));
    }
    pdf.push_str(&format!(
        "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{xref_offset}\n%%EOF\n",
        objects.len() + 1
    ));
    pdf.into_bytes()
}

/// Flattens both streams into `(section, key, value)` rows shared by every
/// renderer.
fn summary_rows(ctx: &ReportContext<'_>) -> Vec<(&'static str, String, String)> {
    let mut rows = Vec::new();
    rows.push(("batch", "batchId".to_string(), ctx.quality.batch_id.clone()));
    rows.push(("batch", "bankId".to_string(), ctx.quality.bank_id.clone()));
    rows.push((
        "quality",
        "grade".to_string(),
        ctx.quality.quality_scores.grade.as_str().to_string(),
    ));
    rows.push((
        "quality",
        "overallScore".to_string(),
        ctx.quality.quality_scores.overall_score.to_string(),
    ));
    for (dimension, score) in &ctx.quality.quality_scores.dimension_scores {
        rows.push(("quality", format!("score.{dimension}"), score.to_string()));
    }
    rows.push((
        "calculation",
        "totalExposures".to_string(),
        ctx.calculation.total_exposures.to_string(),
    ));
    rows.push((
        "calculation",
        "totalAmountEur".to_string(),
        ctx.calculation.total_amount_eur.to_string(),
    ));
    // Record-scoped calculation errors (for example missing FX rates) are
    // carried through from the calculation artifact.
    if let Some(errors) = ctx
        .calculation_artifact
        .get("recordErrors")
        .and_then(|v| v.as_array())
    {
        rows.push((
            "calculation",
            "recordErrors".to_string(),
            errors.len().to_string(),
        ));
    }
    rows
}

fn escape_xml(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn escape_pdf(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('(', "\\(")
        .replace(')', "\\)")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{BatchCalculationCompleted, BatchQualityCompleted};
    use crate::models::{QualityGrade, QualityScores};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn ctx_parts() -> (BatchQualityCompleted, BatchCalculationCompleted, serde_json::Value, serde_json::Value)
    {
        let mut dimension_scores = BTreeMap::new();
        dimension_scores.insert("UNIQUENESS".to_string(), dec!(33.33));
        (
            BatchQualityCompleted {
                batch_id: "b1".to_string(),
                bank_id: "08081".to_string(),
                result_uri: "regflow://b/derived/b1/quality.json?v=1".to_string(),
                quality_scores: QualityScores {
                    dimension_scores,
                    overall_score: dec!(88.89),
                    grade: QualityGrade::B,
                },
                timestamp: Utc::now(),
            },
            BatchCalculationCompleted {
                batch_id: "b1".to_string(),
                bank_id: "08081".to_string(),
                result_uri: "regflow://b/derived/b1/calc.json?v=1".to_string(),
                total_exposures: 3,
                total_amount_eur: dec!(1000.00),
                completed_at: Utc::now(),
            },
            serde_json::json!({"violations": 2}),
            serde_json::json!({"recordErrors": [{"exposureId": "E2"}]}),
        )
    }

    #[test]
    fn test_spreadsheet_contains_scores_and_errors() {
        let (quality, calculation, qa, ca) = ctx_parts();
        let ctx = ReportContext {
            quality: &quality,
            calculation: &calculation,
            quality_artifact: &qa,
            calculation_artifact: &ca,
        };
        let bytes = render_spreadsheet(&ctx).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("score.UNIQUENESS,33.33"));
        assert!(text.contains("recordErrors,1"));
        assert!(text.contains("grade,B"));
    }

    #[test]
    fn test_xbrl_is_escaped_and_well_formed_enough() {
        let (mut quality, calculation, qa, ca) = ctx_parts();
        quality.bank_id = "bank & co".to_string();
        let ctx = ReportContext {
            quality: &quality,
            calculation: &calculation,
            quality_artifact: &qa,
            calculation_artifact: &ca,
        };
        let text = String::from_utf8(render_xbrl(&ctx)).unwrap();
        assert!(text.starts_with("<?xml"));
        assert!(text.contains("bank &amp; co"));
        assert!(text.ends_with("</xbrli:xbrl>\n"));
    }

    #[test]
    fn test_pdf_has_header_and_trailer() {
        let (quality, calculation, qa, ca) = ctx_parts();
        let ctx = ReportContext {
            quality: &quality,
            calculation: &calculation,
            quality_artifact: &qa,
            calculation_artifact: &ca,
        };
        let bytes = render_pdf(&ctx);
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.starts_with("%PDF-1.4"));
        assert!(text.contains("(Batch: b1) Tj"));
        assert!(text.trim_end().ends_with("%%EOF"));
    }
}
