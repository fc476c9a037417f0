use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::sync::OnceLock;
use std::time::Duration;
use time::macros::format_description;
use time::OffsetDateTime;

// Global clipboard manager channel - initialized once on first use
static CLIPBOARD_SENDER: OnceLock<std_mpsc::Sender<String>> = OnceLock::new();

/// Write the aggregated output to `catalyst-<runes>-<timestamp>.log` in `dir`.
pub fn save_output(dir: &Path, runes: &[String], output: &str) -> Result<PathBuf> {
    let stamp = OffsetDateTime::now_utc()
        .format(format_description!(
            "[year][month][day]-[hour][minute][second]"
        ))
        .context("format timestamp")?;
    let label: String = runes
        .join("+")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '+' || c == '-' { c } else { '_' })
        .take(60)
        .collect();
    let path = dir.join(format!("catalyst-{label}-{stamp}.log"));
    std::fs::write(&path, output).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

/// Initialize the clipboard manager thread if not already initialized.
/// Each copy keeps its clipboard instance alive for a while so clipboard
/// managers on Linux can read the contents.
fn init_clipboard_manager() -> Result<&'static std_mpsc::Sender<String>> {
    CLIPBOARD_SENDER.get_or_init(|| {
        let (tx, rx) = std_mpsc::channel::<String>();

        std::thread::spawn(move || {
            use arboard::Clipboard;

            for text in rx {
                match Clipboard::new() {
                    Ok(mut clipboard) => {
                        if let Err(e) = clipboard.set_text(&text) {
                            tracing::warn!(error = %e, "clipboard write failed");
                            continue;
                        }
                        std::thread::sleep(Duration::from_secs(2));
                    }
                    Err(e) => tracing::warn!(error = %e, "clipboard unavailable"),
                }
            }
        });

        tx
    });

    CLIPBOARD_SENDER
        .get()
        .ok_or_else(|| anyhow::anyhow!("Failed to initialize clipboard manager"))
}

/// Queue `text` for the clipboard thread; returns without waiting.
pub fn copy_to_clipboard(text: &str) -> Result<()> {
    let sender = init_clipboard_manager()?;
    sender
        .send(text.to_string())
        .map_err(|_| anyhow::anyhow!("Clipboard manager channel closed"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saved_output_is_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let runes = vec!["build".to_string(), "deploy prod".to_string()];
        let path = save_output(dir.path(), &runes, "a\nb\n").unwrap();
        let name = path.file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("catalyst-build+deploy_prod-"));
        assert!(name.ends_with(".log"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\nb\n");
    }
}
