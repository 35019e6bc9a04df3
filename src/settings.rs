//! Settings related to the device serial link, the remote build service and
//! the flashing tool.
//!
//! Use the [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
//! pattern to set the configurable values.

use std::{path::PathBuf, time::Duration};

use crate::catalog::UsbId;

// =============================================================================
// Public Interface
// =============================================================================

/// Identity of the remote job-execution service the build requests are
/// submitted to.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ServiceIdentity {
    pub project: String,
    pub region: String,
    pub job_name: String,
}

/// Groups all settings used by `taxiprov` and acts as a
/// [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
/// for the settings.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Settings {
    /// The baud rate used to talk to the device during the handshake.
    pub baud_rate: u32,
    /// Overall time allowed for the serial number line to show up, counted
    /// after the boot grace period.
    pub handshake_timeout: Duration,
    /// Time given to the device to boot after the reset pulse.
    pub boot_grace: Duration,
    /// Time the control lines are held low during the reset pulse.
    pub reset_pulse: Duration,
    /// The keyword prefixing the serial number line in the boot banner.
    pub serial_keyword: String,
    /// USB `vendor:product` pairs of the recognized USB-serial bridges.
    pub known_ports: Vec<UsbId>,

    /// Remote build service.
    pub service: ServiceIdentity,
    /// Positional arguments passed to every build.
    pub build_args: Vec<String>,
    /// Service account key file used for the build service and the storage
    /// bucket.
    pub credentials: PathBuf,
    /// Remote builds not reporting a terminal status within this time are
    /// failed. `None` waits forever.
    pub build_timeout: Option<Duration>,
    /// How often the remote build log is polled.
    pub poll_interval: Duration,

    /// Directory under which every run gets its own staging directory.
    pub staging_root: PathBuf,
    /// The flashing tool executable.
    pub flash_tool: String,
    /// The target chip passed to the flashing tool.
    pub flash_chip: String,
    /// The baud rate used while flashing.
    pub flash_baud_rate: u32,

    /// Restrict creation of `Settings` instances unless through the
    /// `SettingsBuilder`.
    #[doc(hidden)]
    _private_use_builder: (),
}

/// The builder for the `Settings` values.
///
/// All values are optional and have default values that will be used if not
/// explicitly set.
///
/// **Example**
///
/// ```
/// use taxiprov::SettingsBuilder;
///
/// let settings = SettingsBuilder::new().baud_rate(9_600).finalize();
/// assert_eq!(settings.baud_rate, 9_600);
/// ```
pub struct SettingsBuilder {
    settings: Settings,
}
impl SettingsBuilder {
    /// Start building the settings using default values.
    pub fn new() -> Self {
        SettingsBuilder {
            settings: Settings {
                baud_rate: 115_200,
                handshake_timeout: Duration::from_secs(5),
                boot_grace: Duration::from_secs(1),
                reset_pulse: Duration::from_millis(100),
                serial_keyword: "NUMERO_SERIAL".into(),
                known_ports: UsbId::known_bridges(),
                service: ServiceIdentity {
                    project: "wavesbyte-taximetro".into(),
                    region: "us-central1".into(),
                    job_name: "esp32-compiler".into(),
                },
                build_args: vec!["/workspace/compile_and_upload.py".into()],
                credentials: PathBuf::from("credentials.json"),
                build_timeout: None,
                poll_interval: Duration::from_secs(1),
                staging_root: std::env::temp_dir().join("taxiprov"),
                flash_tool: "esptool".into(),
                flash_chip: "esp32".into(),
                flash_baud_rate: 115_200,
                _private_use_builder: (),
            },
        }
    }

    /// Set the baud rate in symbols-per-second
    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.settings.baud_rate = baud_rate;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.settings.handshake_timeout = timeout;
        self
    }

    pub fn boot_grace(mut self, grace: Duration) -> Self {
        self.settings.boot_grace = grace;
        self
    }

    pub fn reset_pulse(mut self, pulse: Duration) -> Self {
        self.settings.reset_pulse = pulse;
        self
    }

    /// Set the keyword of the boot banner line carrying the serial number
    pub fn serial_keyword<'a>(mut self, keyword: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.serial_keyword = keyword.into().into_owned();
        self
    }

    pub fn known_ports(mut self, ids: Vec<UsbId>) -> Self {
        self.settings.known_ports = ids;
        self
    }

    /// Set the project, region and job name of the build service
    pub fn service<'a>(
        mut self,
        project: impl Into<std::borrow::Cow<'a, str>>,
        region: impl Into<std::borrow::Cow<'a, str>>,
        job_name: impl Into<std::borrow::Cow<'a, str>>,
    ) -> Self {
        self.settings.service = ServiceIdentity {
            project: project.into().into_owned(),
            region: region.into().into_owned(),
            job_name: job_name.into().into_owned(),
        };
        self
    }

    pub fn build_args(mut self, args: Vec<String>) -> Self {
        self.settings.build_args = args;
        self
    }

    /// Set the path to the service account key file
    pub fn credentials(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings.credentials = path.into();
        self
    }

    pub fn build_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.settings.build_timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.settings.poll_interval = interval;
        self
    }

    pub fn staging_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings.staging_root = path.into();
        self
    }

    pub fn flash_tool<'a>(mut self, tool: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.flash_tool = tool.into().into_owned();
        self
    }

    pub fn flash_chip<'a>(mut self, chip: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.flash_chip = chip.into().into_owned();
        self
    }

    pub fn flash_baud_rate(mut self, baud_rate: u32) -> Self {
        self.settings.flash_baud_rate = baud_rate;
        self
    }

    pub fn finalize(self) -> Settings {
        self.settings
    }
}
impl Default for SettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn all_default() {
    let settings = SettingsBuilder::new().finalize();
    assert_eq!(settings.baud_rate, 115_200);
    assert_eq!(settings.handshake_timeout, Duration::from_secs(5));
    assert_eq!(settings.boot_grace, Duration::from_secs(1));
    assert_eq!(settings.reset_pulse, Duration::from_millis(100));
    assert_eq!(settings.serial_keyword, "NUMERO_SERIAL");
    assert_eq!(settings.known_ports.len(), 3);
    assert_eq!(settings.service.job_name, "esp32-compiler");
    assert_eq!(settings.build_args, vec!["/workspace/compile_and_upload.py"]);
    assert_eq!(settings.build_timeout, None);
    assert_eq!(settings.flash_tool, "esptool");
}

#[test]
fn baud_rate() {
    let baud_rate = 96_000;
    let settings = SettingsBuilder::new().baud_rate(baud_rate).finalize();
    assert_eq!(settings.baud_rate, baud_rate);
}

#[test]
fn serial_keyword() {
    let settings = SettingsBuilder::new().serial_keyword("SERIAL").finalize();
    assert_eq!(settings.serial_keyword, "SERIAL");
}

#[test]
fn service() {
    let settings = SettingsBuilder::new()
        .service("proj", "europe-west1", "builder")
        .finalize();
    assert_eq!(
        settings.service,
        ServiceIdentity {
            project: "proj".into(),
            region: "europe-west1".into(),
            job_name: "builder".into(),
        }
    );
}

#[test]
fn build_timeout() {
    let settings = SettingsBuilder::new()
        .build_timeout(Some(Duration::from_secs(600)))
        .finalize();
    assert_eq!(settings.build_timeout, Some(Duration::from_secs(600)));
}

#[test]
fn staging_root() {
    let settings = SettingsBuilder::new().staging_root("/tmp/stage").finalize();
    assert_eq!(settings.staging_root, PathBuf::from("/tmp/stage"));
}
