use crate::errors::UpdateError;
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

/// Stream `url` to `dest`, bounded by `timeout`.
///
/// The body is written to a temp file created in `dest`'s own directory so
/// the final rename stays on one filesystem and is atomic: an observer sees
/// either no file or a complete one. A truncated stream (fewer bytes than
/// the advertised content-length, or zero bytes) is `Incomplete`, never
/// silently accepted.
pub async fn fetch(url: &str, dest: &Path, timeout: Duration) -> Result<u64, UpdateError> {
    tracing::info!(
        "Downloading {}...",
        dest.file_name().unwrap_or_default().to_string_lossy()
    );

    let dir = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    tokio::time::timeout(timeout, fetch_inner(url, dest, dir))
        .await
        .map_err(|_| UpdateError::Network(format!("download timed out after {:?}", timeout)))?
}

async fn fetch_inner(url: &str, dest: &Path, dir: &Path) -> Result<u64, UpdateError> {
    let response = reqwest::get(url).await.map_err(UpdateError::from_http)?;
    if !response.status().is_success() {
        return Err(UpdateError::Network(format!(
            "download request failed: {}",
            response.status()
        )));
    }

    let expected = response.content_length();
    let pb = ProgressBar::new(expected.unwrap_or(0));
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb.set_message(format!(
        "Downloading {}",
        dest.file_name().unwrap_or_default().to_string_lossy()
    ));

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    let mut written = 0u64;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(UpdateError::from_http)?;
        tmp.write_all(&chunk)?;
        written += chunk.len() as u64;
        pb.set_position(written);
    }
    tmp.flush()?;

    if written == 0 {
        pb.abandon_with_message("Download empty");
        return Err(UpdateError::Incomplete {
            expected: expected.unwrap_or(0),
            written,
        });
    }
    if let Some(expected) = expected {
        if written != expected {
            pb.abandon_with_message("Download truncated");
            return Err(UpdateError::Incomplete { expected, written });
        }
    }

    tmp.persist(dest).map_err(|e| UpdateError::Io(e.error))?;
    pb.finish_with_message("Download complete");
    tracing::debug!("Wrote {} bytes to {}", written, dest.display());
    Ok(written)
}
