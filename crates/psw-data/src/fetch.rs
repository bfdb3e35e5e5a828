use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use psw_observe::time::unix_time_ms;

use crate::catalog::DatasetSpec;
use crate::DataError;

const EXTRACTED_MARKER: &str = ".extracted";

/// Cache directory for one dataset under the data root.
pub fn dataset_dir(root: &Path, spec: &DatasetSpec) -> PathBuf {
    root.join(spec.kind.name())
}

/// Makes sure the dataset's archive is downloaded and unpacked under `root`,
/// returning the directory holding the binary batches.
///
/// Datasets without a canonical archive (ImageNet) are expected to exist already.
pub async fn ensure_dataset(root: &Path, spec: &DatasetSpec) -> Result<PathBuf, DataError> {
    let dir = dataset_dir(root, spec);
    let Some(archive) = spec.archive else {
        if !dir.is_dir() {
            return Err(DataError::Missing(dir));
        }
        return Ok(dir);
    };

    let batches = dir.join(archive.dir_name);
    if dir.join(EXTRACTED_MARKER).exists() && batches.is_dir() {
        return Ok(batches);
    }
    tokio::fs::create_dir_all(&dir).await?;

    let archive_path = dir.join(archive.file_name);
    fetch_file(archive.url, &archive_path).await?;

    info!(
        dataset = %spec.kind,
        archive = %archive_path.display(),
        "extracting archive"
    );
    let started = std::time::Instant::now();
    let (src, dest) = (archive_path.clone(), dir.clone());
    let files = tokio::task::spawn_blocking(move || crate::archive::unpack_tar_gz(&src, &dest))
        .await
        .map_err(|e| DataError::Tar(format!("extract task failed: {e}")))??;
    tokio::fs::write(dir.join(EXTRACTED_MARKER), format!("files={files}\n")).await?;
    info!(
        dataset = %spec.kind,
        files,
        elapsed_ms = psw_observe::time::elapsed_ms(started),
        "archive extracted"
    );

    if !batches.is_dir() {
        return Err(DataError::Missing(batches));
    }
    Ok(batches)
}

/// Downloads `url` to `dest` unless `dest` already exists. The body lands in a
/// temporary sibling first, so an interrupted download never leaves `dest` behind.
pub async fn fetch_file(url: &str, dest: &Path) -> Result<(), DataError> {
    if tokio::fs::try_exists(dest).await? {
        return Ok(());
    }
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| DataError::Download(e.to_string()))?;
    download(&client, url, dest).await
}

async fn download(client: &reqwest::Client, url: &str, path: &Path) -> Result<(), DataError> {
    info!(url, dest = %path.display(), "downloading");
    let mut resp = get_with_retry(client, url).await?;
    if !resp.status().is_success() {
        return Err(DataError::Download(format!(
            "GET {url} returned status {}",
            resp.status()
        )));
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(
        ".{file_name}.part.{}.{}",
        std::process::id(),
        unix_time_ms()
    ));
    let mut out = tokio::fs::File::create(&tmp).await?;
    let mut total: u64 = 0;
    while let Some(chunk) = resp
        .chunk()
        .await
        .map_err(|e| DataError::Download(format!("{url}: {e}")))?
    {
        out.write_all(&chunk).await?;
        total += chunk.len() as u64;
    }
    out.flush().await?;
    out.sync_all().await?;
    drop(out);

    if total == 0 {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(DataError::Download(format!("{url}: empty body")));
    }
    tokio::fs::rename(&tmp, path).await?;
    info!(url, bytes = total, "download complete");
    Ok(())
}

async fn get_with_retry(client: &reqwest::Client, url: &str) -> Result<reqwest::Response, DataError> {
    const MAX_ATTEMPTS: usize = 5;
    const BASE_DELAY_MS: u64 = 200;
    const MAX_DELAY_MS: u64 = 5_000;

    let mut attempt: usize = 0;
    let mut delay_ms: u64 = BASE_DELAY_MS;
    loop {
        attempt = attempt.saturating_add(1);
        let transient = match client.get(url).send().await {
            Ok(resp) => {
                let status = resp.status();
                let transient = status == reqwest::StatusCode::TOO_MANY_REQUESTS
                    || status == reqwest::StatusCode::REQUEST_TIMEOUT
                    || status.is_server_error();
                if !transient || attempt >= MAX_ATTEMPTS {
                    return Ok(resp);
                }
                format!("status {status}")
            }
            Err(err) => {
                let transient = err.is_timeout() || err.is_connect();
                if !transient || attempt >= MAX_ATTEMPTS {
                    return Err(DataError::Download(format!("{url}: {err}")));
                }
                err.to_string()
            }
        };
        warn!(url, attempt, delay_ms, reason = %transient, "retrying download");
        tokio::time::sleep(Duration::from_millis(delay_ms + unix_time_ms() % 37)).await;
        delay_ms = delay_ms.saturating_mul(2).min(MAX_DELAY_MS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::spec_for;
    use psw_core::types::DatasetKind;

    #[tokio::test]
    async fn imagenet_requires_local_copy() {
        let root = std::env::temp_dir().join(format!(
            "psw-fetch-missing-{}-{}",
            std::process::id(),
            unix_time_ms()
        ));
        let spec = spec_for(DatasetKind::Imagenet, 64);
        let err = ensure_dataset(&root, &spec).await.unwrap_err();
        assert!(matches!(err, DataError::Missing(p) if p.ends_with("imagenet")));
    }

    #[tokio::test]
    async fn existing_file_is_not_downloaded_again() {
        let root = std::env::temp_dir().join(format!(
            "psw-fetch-file-{}-{}",
            std::process::id(),
            unix_time_ms()
        ));
        std::fs::create_dir_all(&root).unwrap();
        let dest = root.join("resnet18-f37072fd.pth");
        std::fs::write(&dest, b"cached").unwrap();
        // The URL is unroutable; success means no request was made.
        fetch_file("http://127.0.0.1:9/resnet18-f37072fd.pth", &dest)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"cached");
    }

    #[tokio::test]
    async fn extracted_cache_short_circuits() {
        let root = std::env::temp_dir().join(format!(
            "psw-fetch-cached-{}-{}",
            std::process::id(),
            unix_time_ms()
        ));
        let spec = spec_for(DatasetKind::Cifar10, 32);
        let dir = dataset_dir(&root, &spec);
        std::fs::create_dir_all(dir.join("cifar-10-batches-bin")).unwrap();
        std::fs::write(dir.join(EXTRACTED_MARKER), "files=0\n").unwrap();

        let batches = ensure_dataset(&root, &spec).await.unwrap();
        assert_eq!(batches, dir.join("cifar-10-batches-bin"));
    }
}
