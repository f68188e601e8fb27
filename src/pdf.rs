use std::path::Path;
use std::process::Command;

use anyhow::Context as _;

/// Seam to the external HTML→PDF renderer. The pipeline only needs "turn
/// this HTML file into that PDF file"; tests substitute their own impl.
pub trait PdfRenderer: Send + Sync {
    fn render(&self, html_path: &Path, pdf_path: &Path) -> anyhow::Result<()>;
}

/// Default renderer: shells out as `<bin> <html> <pdf>` (wkhtmltopdf
/// compatible).
pub struct CommandPdfRenderer {
    bin: String,
}

impl CommandPdfRenderer {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

impl PdfRenderer for CommandPdfRenderer {
    fn render(&self, html_path: &Path, pdf_path: &Path) -> anyhow::Result<()> {
        tracing::debug!(bin = %self.bin, html = %html_path.display(), pdf = %pdf_path.display(), "render pdf");

        let output = Command::new(&self.bin)
            .arg(html_path)
            .arg(pdf_path)
            .output()
            .with_context(|| format!("spawn pdf renderer: {}", self.bin))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "pdf renderer failed ({}): {}",
                output.status,
                stderr.trim()
            );
        }
        if !pdf_path.exists() {
            anyhow::bail!("pdf renderer produced no output: {}", pdf_path.display());
        }
        Ok(())
    }
}
