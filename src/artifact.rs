//! Retrieval of the firmware built remotely and flashing it onto the device.
//!
//! Every attempt works in its own staging directory, named after the job kind
//! and the run identifier, which is removed together with everything downloaded into it
//! when the attempt ends, whether flashing succeeded or not.
//!
//! Two flash layouts are supported:
//!
//! ```text
//!  Application             Full (device reset)
//!  -----------             -------------------
//!                          0x01000  bootloader
//!                          0x08000  partition table
//!  0x10000  firmware       0x10000  firmware
//! ```

use std::{
    fmt,
    fs::{self, File},
    path::{Path, PathBuf},
    process::Command,
    str::FromStr,
    sync::Arc,
};

use log::{debug, info, warn};

use crate::{
    auth::TokenSource,
    error::{DownloadError, FlashError, PipelineError},
    job::{JobId, JobKind},
};

pub const BOOTLOADER_OFFSET: u32 = 0x1000;
pub const PARTITION_TABLE_OFFSET: u32 = 0x8000;
pub const FIRMWARE_OFFSET: u32 = 0x10000;

// =============================================================================
// Public Interface
// =============================================================================

// ArtifactLocator =============================================================

/// Location of a remote object, written `gs://bucket/key` or `bucket/key`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ArtifactLocator {
    pub bucket: String,
    pub object: String,
}
impl ArtifactLocator {
    /// The last path segment of the object key.
    pub fn file_name(&self) -> &str {
        self.object.rsplit('/').next().unwrap_or(&self.object)
    }

    /// Another object next to this one, with the `.bin` suffix (or
    /// `.ino.bin` for Arduino builds) replaced by `.<part>.bin`.
    pub fn companion(&self, part: &str) -> ArtifactLocator {
        let stem = self
            .object
            .strip_suffix(".ino.bin")
            .map(|s| format!("{}.ino", s))
            .or_else(|| self.object.strip_suffix(".bin").map(String::from))
            .unwrap_or_else(|| self.object.clone());
        ArtifactLocator {
            bucket: self.bucket.clone(),
            object: format!("{}.{}.bin", stem, part),
        }
    }
}
impl FromStr for ArtifactLocator {
    type Err = DownloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let path = s.trim();
        let path = path.strip_prefix("gs://").unwrap_or(path);
        let mut parts = path.splitn(2, '/');
        match (parts.next(), parts.next()) {
            (Some(bucket), Some(object)) if !bucket.is_empty() && !object.is_empty() => {
                Ok(ArtifactLocator {
                    bucket: bucket.into(),
                    object: object.into(),
                })
            }
            _ => Err(DownloadError::InvalidLocator(s.into())),
        }
    }
}
impl fmt::Display for ArtifactLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gs://{}/{}", self.bucket, self.object)
    }
}

/// A remote artifact and where it was downloaded for one run.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FirmwareArtifact {
    pub remote_locator: ArtifactLocator,
    pub local_path: PathBuf,
    pub run_id: JobId,
}

// ArtifactStore ===============================================================

/// Fetches remote objects.
pub trait ArtifactStore: Send + Sync {
    fn download(&self, locator: &ArtifactLocator, dest: &Path) -> Result<(), DownloadError>;
}

/// Downloads objects through the Cloud Storage JSON API.
pub struct GcsStore<T: TokenSource> {
    client: reqwest::blocking::Client,
    tokens: T,
    endpoint: String,
}
impl<T: TokenSource> GcsStore<T> {
    pub fn new(tokens: T) -> Self {
        Self::with_endpoint(tokens, "https://storage.googleapis.com")
    }

    pub fn with_endpoint(tokens: T, endpoint: impl Into<String>) -> Self {
        GcsStore {
            client: reqwest::blocking::Client::new(),
            tokens,
            endpoint: endpoint.into(),
        }
    }

    fn media_url(&self, locator: &ArtifactLocator) -> Result<reqwest::Url, DownloadError> {
        let invalid = || DownloadError::InvalidLocator(locator.to_string());
        let mut url = reqwest::Url::parse(&self.endpoint).map_err(|_| invalid())?;
        url.path_segments_mut()
            .map_err(|_| invalid())?
            .pop_if_empty()
            .extend(&[
                "storage",
                "v1",
                "b",
                locator.bucket.as_str(),
                "o",
                locator.object.as_str(),
            ]);
        url.query_pairs_mut().append_pair("alt", "media");
        Ok(url)
    }
}
impl<T: TokenSource> ArtifactStore for GcsStore<T> {
    fn download(&self, locator: &ArtifactLocator, dest: &Path) -> Result<(), DownloadError> {
        let url = self.media_url(locator)?;
        let token = self.tokens.token()?;
        info!("Downloading {} to {}", locator, dest.display());

        let mut response = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .map_err(DownloadError::Transport)?;
        if !response.status().is_success() {
            return Err(DownloadError::Status {
                object: locator.to_string(),
                status: response.status().as_u16(),
            });
        }

        let write_error = |source| DownloadError::Write {
            path: dest.to_path_buf(),
            source,
        };
        let mut file = File::create(dest).map_err(write_error)?;
        let bytes = response.copy_to(&mut file).map_err(DownloadError::Transport)?;
        file.sync_all().map_err(write_error)?;
        debug!("{} bytes written to {}", bytes, dest.display());
        Ok(())
    }
}

// Flasher =====================================================================

/// One image written at a fixed flash offset.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FlashImage {
    pub offset: u32,
    pub path: PathBuf,
}

/// Which images are written to the device.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FlashMode {
    /// Firmware only, at [`FIRMWARE_OFFSET`].
    Application,
    /// Bootloader, partition table and firmware.
    Full,
}

/// Writes images to the flash memory of the device on `port`.
pub trait Flasher: Send + Sync {
    fn flash(&self, port: &str, images: &[FlashImage]) -> Result<(), FlashError>;
}

/// Flashes with Espressif's `esptool`, run as a child process. Its exit code
/// decides success.
pub struct Esptool {
    program: String,
    chip: String,
    baud_rate: u32,
}
impl Esptool {
    pub fn new(program: impl Into<String>, chip: impl Into<String>, baud_rate: u32) -> Self {
        Esptool {
            program: program.into(),
            chip: chip.into(),
            baud_rate,
        }
    }

    pub fn args(&self, port: &str, images: &[FlashImage]) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--chip".into(),
            self.chip.clone(),
            "--port".into(),
            port.into(),
            "--baud".into(),
            self.baud_rate.to_string(),
            "write_flash".into(),
            "-z".into(),
            "--flash_mode".into(),
            "dio".into(),
            "--flash_size".into(),
            "4MB".into(),
        ];
        for image in images {
            args.push(format!("{:#x}", image.offset));
            args.push(image.path.display().to_string());
        }
        args
    }
}
impl Flasher for Esptool {
    fn flash(&self, port: &str, images: &[FlashImage]) -> Result<(), FlashError> {
        let args = self.args(port, images);
        info!("Running {} {}", self.program, args.join(" "));
        let status = Command::new(&self.program)
            .args(&args)
            .status()
            .map_err(FlashError::Spawn)?;
        match status.code() {
            Some(0) => Ok(()),
            Some(code) => Err(FlashError::Failed { code }),
            // Terminated by a signal
            None => Err(FlashError::Failed { code: -1 }),
        }
    }
}

// FlashPipeline ===============================================================

/// Progress of one pipeline attempt, reported before each step.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PipelineStep {
    Downloading,
    Flashing,
}

/// Download the artifacts of a run and flash them.
pub struct FlashPipeline {
    store: Arc<dyn ArtifactStore>,
    flasher: Arc<dyn Flasher>,
    staging_root: PathBuf,
}
impl FlashPipeline {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        flasher: Arc<dyn Flasher>,
        staging_root: impl Into<PathBuf>,
    ) -> Self {
        FlashPipeline {
            store,
            flasher,
            staging_root: staging_root.into(),
        }
    }

    /// The directory the artifacts of the `kind` job of `run_id` are
    /// downloaded to.
    pub fn staging_dir(&self, kind: JobKind, run_id: &JobId) -> PathBuf {
        self.staging_root
            .join(kind.as_str())
            .join(path_component(run_id.as_str()))
    }

    /// Download the firmware at `locator` (plus its bootloader and partition
    /// table for [`FlashMode::Full`]) and flash it onto the device on `port`.
    ///
    /// The staging directory and the downloaded files are gone when this
    /// returns.
    pub fn run(
        &self,
        locator: &ArtifactLocator,
        kind: JobKind,
        run_id: &JobId,
        port: &str,
        mode: FlashMode,
        progress: &mut dyn FnMut(PipelineStep),
    ) -> Result<(), PipelineError> {
        let staging = StagingDir::create(self.staging_dir(kind, run_id))?;

        progress(PipelineStep::Downloading);
        let firmware = self.fetch(&staging, locator, run_id)?;
        let images = match mode {
            FlashMode::Application => vec![FlashImage {
                offset: FIRMWARE_OFFSET,
                path: firmware.local_path,
            }],
            FlashMode::Full => {
                let bootloader = self.fetch(&staging, &locator.companion("bootloader"), run_id)?;
                let partitions = self.fetch(&staging, &locator.companion("partitions"), run_id)?;
                vec![
                    FlashImage {
                        offset: BOOTLOADER_OFFSET,
                        path: bootloader.local_path,
                    },
                    FlashImage {
                        offset: PARTITION_TABLE_OFFSET,
                        path: partitions.local_path,
                    },
                    FlashImage {
                        offset: FIRMWARE_OFFSET,
                        path: firmware.local_path,
                    },
                ]
            }
        };

        progress(PipelineStep::Flashing);
        self.flasher.flash(port, &images)?;
        info!("{} flashed with {}", port, locator);
        Ok(())
    }

    fn fetch(
        &self,
        staging: &StagingDir,
        locator: &ArtifactLocator,
        run_id: &JobId,
    ) -> Result<FirmwareArtifact, DownloadError> {
        let local_path = staging.path.join(path_component(locator.file_name()));
        self.store.download(locator, &local_path)?;
        Ok(FirmwareArtifact {
            remote_locator: locator.clone(),
            local_path,
            run_id: run_id.clone(),
        })
    }
}

// =============================================================================
// Private stuff
// =============================================================================

/// A run-scoped directory, removed with its content when dropped.
struct StagingDir {
    path: PathBuf,
}
impl StagingDir {
    fn create(path: PathBuf) -> Result<Self, PipelineError> {
        fs::create_dir_all(&path).map_err(|source| PipelineError::Staging {
            path: path.clone(),
            source,
        })?;
        debug!("staging directory {} ready", path.display());
        Ok(StagingDir { path })
    }
}
impl Drop for StagingDir {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => debug!("staging directory {} removed", self.path.display()),
            Err(e) => warn!("failed to remove {}: {}", self.path.display(), e),
        }
    }
}

/// Make `name` safe to use as a single path component.
fn path_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".into()
    } else if cleaned.chars().all(|c| c == '.') {
        cleaned.replace('.', "_")
    } else {
        cleaned
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
