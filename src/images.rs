//! Image Registry Facade (C7, spec §4.7).
//!
//! Admission validates size (<=1 GiB) and non-corruption via `qemu-img`
//! exactly as the original `image_manager_api/main.py` does
//! (`qemu-img check`, `qemu-img info --output=json`), then propagates the
//! file to both clusters in parallel and records the OpenStack foreign id.
//! Partial failures leave the row with a null foreign id -- readable and
//! reusable on the other cluster only (§4.7).

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::process::Command;

use crate::domain::{Image, ImageLifecycle, ImportSource};
use crate::store::error::{Result, StoreError};
use crate::store::DataStore;

const MAX_IMAGE_BYTES: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct QemuImgInfo {
    format: String,
}

async fn detect_format(path: &Path) -> Result<String> {
    let output = Command::new("qemu-img")
        .args(["info", "--output=json"])
        .arg(path)
        .output()
        .await
        .map_err(|e| StoreError::DependencyUnavailable(format!("qemu-img info failed to spawn: {e}")))?;

    if !output.status.success() {
        return Ok("raw".to_string());
    }
    let info: QemuImgInfo = serde_json::from_slice(&output.stdout)
        .map_err(|e| StoreError::Validation(format!("qemu-img info produced unparseable output: {e}")))?;
    Ok(info.format)
}

async fn check_integrity(path: &Path) -> Result<()> {
    let output = Command::new("qemu-img")
        .arg("check")
        .arg(path)
        .output()
        .await
        .map_err(|e| StoreError::DependencyUnavailable(format!("qemu-img check failed to spawn: {e}")))?;

    if !output.status.success() {
        return Err(StoreError::Validation(format!(
            "image failed qemu-img integrity check: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

pub struct ImageCatalogClient {
    http: reqwest::Client,
    base_url: String,
}

impl ImageCatalogClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    pub async fn download(&self, name: &str, dest: &Path) -> Result<()> {
        let resp = self
            .http
            .get(format!("{}/download", self.base_url))
            .query(&[("nombre", name)])
            .send()
            .await
            .map_err(|e| StoreError::DependencyUnavailable(format!("image catalog download failed: {e}")))?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| StoreError::DependencyUnavailable(format!("image catalog stream failed: {e}")))?;
        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|e| StoreError::Internal(format!("writing downloaded image failed: {e}")))?;
        Ok(())
    }

    pub async fn upload(&self, path: &Path) -> Result<()> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| StoreError::Internal(format!("reading image for upload failed: {e}")))?;
        let form = reqwest::multipart::Form::new().part(
            "file",
            reqwest::multipart::Part::bytes(bytes).file_name(
                path.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            ),
        );
        self.http
            .post(format!("{}/import-image", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| StoreError::DependencyUnavailable(format!("image catalog upload failed: {e}")))?;
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        self.http
            .delete(format!("{}/delete-image/{id}", self.base_url))
            .send()
            .await
            .map_err(|e| StoreError::DependencyUnavailable(format!("image catalog delete failed: {e}")))?;
        Ok(())
    }
}

/// Upload the image bytes to the OpenStack Image (Glance) API, returning
/// the foreign image id.
pub struct OpenstackImageClient {
    http: reqwest::Client,
    base_url: String,
    admin_token: String,
}

impl OpenstackImageClient {
    pub fn new(base_url: impl Into<String>, admin_token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            admin_token: admin_token.into(),
        }
    }

    pub async fn upload(&self, name: &str, path: &Path, format: &str) -> Result<String> {
        let create = self
            .http
            .post(format!("{}/v2/images", self.base_url))
            .header("X-Auth-Token", &self.admin_token)
            .json(&serde_json::json!({ "name": name, "disk_format": format, "container_format": "bare" }))
            .send()
            .await
            .map_err(|e| StoreError::DependencyUnavailable(format!("glance image create failed: {e}")))?;
        let created: serde_json::Value = create
            .json()
            .await
            .map_err(|e| StoreError::DriverFailure(format!("glance image create response malformed: {e}")))?;
        let image_id = created["id"]
            .as_str()
            .ok_or_else(|| StoreError::DriverFailure("glance image create: missing id".into()))?
            .to_string();

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| StoreError::Internal(format!("reading image for glance upload failed: {e}")))?;
        self.http
            .put(format!("{}/v2/images/{image_id}/file", self.base_url))
            .header("X-Auth-Token", &self.admin_token)
            .header("Content-Type", "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .map_err(|e| StoreError::DependencyUnavailable(format!("glance image upload failed: {e}")))?;

        Ok(image_id)
    }

    pub async fn delete(&self, foreign_id: &str) -> Result<()> {
        self.http
            .delete(format!("{}/v2/images/{foreign_id}", self.base_url))
            .header("X-Auth-Token", &self.admin_token)
            .send()
            .await
            .map_err(|e| StoreError::DependencyUnavailable(format!("glance image delete failed: {e}")))?;
        Ok(())
    }
}

/// Admit an image already staged on local disk at `staged_path` (downloaded
/// from a URL or received as a multipart upload by the caller). Validates,
/// renames to `image_{id}.{ext}`, inserts the row, and propagates to both
/// clusters in parallel (§4.7).
pub async fn admit_image(
    store: &dyn DataStore,
    audit: &crate::audit::ApiAuditLogger,
    images_dir: &Path,
    catalog: &ImageCatalogClient,
    openstack_images: &OpenstackImageClient,
    staged_path: &Path,
    name: &str,
    description: Option<&str>,
    import_source: ImportSource,
) -> Result<Image> {
    if name.chars().count() > 30 {
        return Err(StoreError::Validation("image name must be at most 30 characters".into()));
    }
    if description.is_some_and(|d| d.chars().count() > 100) {
        return Err(StoreError::Validation("image description must be at most 100 characters".into()));
    }

    let size_bytes = tokio::fs::metadata(staged_path)
        .await
        .map_err(|e| StoreError::Internal(format!("stat staged image failed: {e}")))?
        .len();
    if size_bytes > MAX_IMAGE_BYTES {
        return Err(StoreError::Validation(format!(
            "image is {size_bytes} bytes, exceeds the 1 GiB limit"
        )));
    }

    check_integrity(staged_path).await?;
    let format = detect_format(staged_path).await?;

    let image = store
        .create_image(name, description, "", &format, size_bytes, import_source)
        .await?;

    let ext = staged_path.extension().and_then(|e| e.to_str()).unwrap_or(&format);
    let filename = format!("image_{}.{ext}", image.id);
    let final_path: PathBuf = images_dir.join(&filename);
    tokio::fs::rename(staged_path, &final_path)
        .await
        .map_err(|e| StoreError::Internal(format!("renaming staged image failed: {e}")))?;

    store.set_image_filename(image.id, &filename).await?;
    store.set_image_lifecycle(image.id, ImageLifecycle::Validated).await?;

    let (catalog_result, openstack_result) = tokio::join!(
        catalog.upload(&final_path),
        openstack_images.upload(name, &final_path, &format)
    );

    if let Err(e) = catalog_result {
        tracing::warn!(image_id = image.id, error = %e, "image catalog propagation failed, row remains readable");
    }

    let openstack_id = match openstack_result {
        Ok(id) => Some(id),
        Err(e) => {
            tracing::warn!(image_id = image.id, error = %e, "openstack propagation failed, row remains readable on linux only");
            None
        }
    };
    store.set_image_openstack_id(image.id, openstack_id).await?;
    store.set_image_lifecycle(image.id, ImageLifecycle::Propagated).await?;
    store.set_image_lifecycle(image.id, ImageLifecycle::Registered).await?;

    audit.image_registered(image.id, name);
    store.get_image(image.id).await
}

/// Delete cascades to both clusters; local delete proceeds even if either
/// cluster delete fails (operator visibility only, §4.7).
pub async fn delete_image(
    store: &dyn DataStore,
    audit: &crate::audit::ApiAuditLogger,
    images_dir: &Path,
    catalog: &ImageCatalogClient,
    openstack_images: &OpenstackImageClient,
    id: i64,
) -> Result<()> {
    let image = store.get_image(id).await?;

    if let Err(e) = catalog.delete(id).await {
        tracing::warn!(image_id = id, error = %e, "image catalog delete failed, continuing local delete");
    }
    if let Some(foreign_id) = &image.openstack_id {
        if let Err(e) = openstack_images.delete(foreign_id).await {
            tracing::warn!(image_id = id, error = %e, "openstack image delete failed, continuing local delete");
        }
    }

    let local_path = images_dir.join(&image.filename);
    let _ = tokio::fs::remove_file(&local_path).await;

    store.delete_image(id).await?;
    audit.image_deleted(id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::ApiAuditLogger;
    use crate::store::memory::MemoryStore;
    use crate::store::ImageStore;

    #[test]
    fn max_image_bytes_matches_spec() {
        assert_eq!(MAX_IMAGE_BYTES, 1024 * 1024 * 1024);
    }

    #[tokio::test]
    async fn admit_image_rejects_name_over_30_chars_before_any_side_effect() {
        let store = MemoryStore::new();
        let audit = ApiAuditLogger::new();
        let catalog = ImageCatalogClient::new("http://127.0.0.1:1");
        let openstack = OpenstackImageClient::new("http://127.0.0.1:1", "");
        let long_name = "x".repeat(31);

        let err = admit_image(
            &store,
            &audit,
            Path::new("/nonexistent/staged.img"),
            &catalog,
            &openstack,
            Path::new("/nonexistent/staged.img"),
            &long_name,
            None,
            ImportSource::File,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, StoreError::Validation(_)));
        assert!(store.list_images().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn admit_image_rejects_description_over_100_chars() {
        let store = MemoryStore::new();
        let audit = ApiAuditLogger::new();
        let catalog = ImageCatalogClient::new("http://127.0.0.1:1");
        let openstack = OpenstackImageClient::new("http://127.0.0.1:1", "");
        let long_description = "x".repeat(101);

        let err = admit_image(
            &store,
            &audit,
            Path::new("/nonexistent/staged.img"),
            &catalog,
            &openstack,
            Path::new("/nonexistent/staged.img"),
            "cirros",
            Some(&long_description),
            ImportSource::File,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, StoreError::Validation(_)));
        assert!(store.list_images().await.unwrap().is_empty());
    }
}
