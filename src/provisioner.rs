//! Provisioning jobs: remote firmware build, artifact download and flashing.
//!
//! **Example** - Running a job and following its status:
//! ```no_run
//! use std::{collections::BTreeMap, sync::Arc, time::Duration};
//!
//! use taxiprov::{self as tp, JobKind, JobRequest, Provisioner};
//!
//! let settings = tp::SettingsBuilder::default().finalize();
//! let tokens = Arc::new(tp::GcloudToken::new(settings.credentials.clone()));
//! let provisioner = Provisioner::new(
//!     settings.clone(),
//!     Arc::new(tp::CloudRunApi::new(Arc::clone(&tokens))),
//!     Arc::new(tp::FirestorePoller::new(
//!         &settings.service.project,
//!         tokens.clone(),
//!         Duration::from_secs(1),
//!     )),
//!     Arc::new(tp::GcsStore::new(tokens)),
//!     Arc::new(tp::Esptool::new("esptool", "esp32", 115_200)),
//! );
//!
//! let updates = provisioner.watch();
//! let run_id = provisioner
//!     .execute(JobRequest {
//!         kind: JobKind::Params,
//!         owner: "operator".into(),
//!         target_serial: "000006".into(),
//!         port: "/dev/ttyUSB0".into(),
//!         run_id: None,
//!         parameters: BTreeMap::new(),
//!     })
//!     .expect("build rejected");
//! println!("run {} started", run_id);
//! for update in updates {
//!     println!("{}", update.status);
//! }
//! ```

mod board;
mod events;
mod state_machine;
mod states;

pub use state_machine::{JobRequest, Provisioner};
