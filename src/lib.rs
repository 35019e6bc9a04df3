//! Taxiprov provisions taximeter boards: it reads the serial number a board
//! announces on its boot banner, asks a remote build service to compile the
//! firmware for that board, follows the build log, then downloads the
//! resulting image and flashes it onto the board over the serial port.
//!
//! Two kinds of jobs exist, `params` (application image only) and
//! `set_serial` (bootloader, partition table and application). At most one job
//! of each kind is in flight at any time.
//!
//! Each job is implemented as a state machine. State machines are implemented
//! in terms of **states** and **transitions** between them with the following
//! characteristics:
//!
//! * Can only be in one state at any time.
//! * Each state can have its own associated data if needed.
//! * It is possible to have some shared data between **all** states.
//! * Transitions between states are triggered via typed **events** and follow
//!   defined semantics.
//! * Only explicitly defined transitions should be permitted and as many errors
//!   should be detected at **compile-time**.
//! * Transitioning from one state to another consumes the original state and
//!   renders it unusable.
//! * Data can be transferred from one state to the next by attaching it to the
//!   transition event.
//!
//! The implementation of state transitions leverages `rust`'s `From` and `Into`
//! pattern. The `From` trait allows for a type to define how to create itself
//! from another type, hence providing us an intuitive and simple mechanism for
//! converting `events` into new `states`. Only transitions for which the `From`
//! trait is implemented are authorized.
//!
//! Everything talking to the outside world sits behind a trait, so that the
//! state machine can be driven by the real services or by test doubles:
//!
//! * [`LinkOpener`] / [`DeviceLink`] for the serial link to the board,
//! * [`JobDispatcher`] for the remote build service,
//! * [`ChangeStream`] for the remote build log,
//! * [`ArtifactStore`] for the bucket holding the built images,
//! * [`Flasher`] for the flashing tool,
//! * [`TokenSource`] for the access tokens of the remote services.

mod artifact;
mod auth;
mod catalog;
mod change_stream;
mod dispatch;
mod error;
mod handshake;
mod job;
mod provisioner;
mod settings;
pub mod utils;

pub use artifact::{
    ArtifactLocator, ArtifactStore, Esptool, FirmwareArtifact, FlashImage, FlashMode,
    FlashPipeline, Flasher, GcsStore, PipelineStep, BOOTLOADER_OFFSET, FIRMWARE_OFFSET,
    PARTITION_TABLE_OFFSET,
};
pub use auth::{activate_service_account, GcloudToken, StaticToken, TokenSource};
pub use catalog::{is_port_connected, list_ports, SerialPortInfo, UsbId};
pub use change_stream::{ChangeStream, FirestorePoller, Listener, Subscriber};
pub use dispatch::{BuildRequest, CloudRunApi, GcloudCli, JobDispatcher};
pub use error::{
    AuthError, DispatchError, DownloadError, FlashError, HandshakeError, PipelineError,
    ProvisionError, SubscriptionError,
};
pub use handshake::{handshake, read_identity, DeviceLink, LinkOpener, SerialOpener};
pub use job::{
    BuildOutcome, Delivery, DeviceIdentity, Job, JobContext, JobId, JobKind, JobPhase,
    JobStatusEvent, StatusUpdate, SubscriptionKey,
};
pub use provisioner::{JobRequest, Provisioner};
pub use settings::{ServiceIdentity, Settings, SettingsBuilder};
