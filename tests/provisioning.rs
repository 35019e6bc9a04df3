use std::{
    collections::BTreeMap,
    fs, io,
    panic::{self, AssertUnwindSafe},
    path::Path,
    sync::{
        mpsc::{Receiver, Sender},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use serde_json::{json, Value};
use tempfile::TempDir;

use taxiprov::{
    ArtifactLocator, ArtifactStore, BuildRequest, ChangeStream, Delivery, DispatchError,
    DownloadError, FlashError, FlashImage, Flasher, JobContext, JobDispatcher, JobId, JobKind,
    JobPhase, JobRequest, JobStatusEvent, Listener, ProvisionError, Provisioner, SettingsBuilder,
    StatusUpdate, SubscriptionError, BOOTLOADER_OFFSET, FIRMWARE_OFFSET, PARTITION_TABLE_OFFSET,
};

// Test doubles ================================================================

#[derive(Default)]
struct FakeDispatcher {
    requests: Mutex<Vec<BuildRequest>>,
    reject: bool,
    crash: bool,
}
impl JobDispatcher for FakeDispatcher {
    fn dispatch(&self, request: &BuildRequest) -> Result<(), DispatchError> {
        self.requests.lock().unwrap().push(request.clone());
        if self.crash {
            panic!("build service client crashed");
        }
        if self.reject {
            return Err(DispatchError::Rejected("quota exceeded".into()));
        }
        Ok(())
    }
}

type Route = Arc<Mutex<Option<(Sender<Delivery>, JobContext)>>>;

/// Keeps the sink of every listener so that tests can push build log changes.
#[derive(Default)]
struct ScriptedStream {
    routes: Mutex<BTreeMap<String, Route>>,
    cancelled: Arc<Mutex<Vec<String>>>,
    refuse: bool,
}
impl ScriptedStream {
    fn push(&self, kind: JobKind, payload: Value) -> bool {
        let routes = self.routes.lock().unwrap();
        for route in routes.values() {
            if let Some((sink, context)) = &*route.lock().unwrap() {
                if context.kind == kind {
                    return sink
                        .send(Delivery {
                            context: context.clone(),
                            event: JobStatusEvent::from_payload(payload),
                        })
                        .is_ok();
                }
            }
        }
        false
    }

    fn push_foreign(&self, kind: JobKind, payload: Value) {
        let routes = self.routes.lock().unwrap();
        for route in routes.values() {
            if let Some((sink, context)) = &*route.lock().unwrap() {
                if context.kind == kind {
                    let mut context = context.clone();
                    context.job_id = JobId::new("someone-else");
                    let _ = sink.send(Delivery {
                        context,
                        event: JobStatusEvent::from_payload(payload.clone()),
                    });
                }
            }
        }
    }

    fn locations(&self) -> Vec<String> {
        self.routes.lock().unwrap().keys().cloned().collect()
    }

    fn contexts(&self) -> Vec<JobContext> {
        self.routes
            .lock()
            .unwrap()
            .values()
            .filter_map(|r| r.lock().unwrap().as_ref().map(|(_, c)| c.clone()))
            .collect()
    }

    fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }
}

struct ScriptedListener {
    location: String,
    route: Route,
    cancelled: Arc<Mutex<Vec<String>>>,
}
impl Listener for ScriptedListener {
    fn cancel(self: Box<Self>) {
        self.route.lock().unwrap().take();
        self.cancelled.lock().unwrap().push(self.location);
    }
}

impl ChangeStream for ScriptedStream {
    fn listen(
        &self,
        location: &str,
        context: JobContext,
        sink: Sender<Delivery>,
    ) -> Result<Box<dyn Listener>, SubscriptionError> {
        if self.refuse {
            return Err(SubscriptionError::Listener {
                location: location.into(),
                source: io::Error::new(io::ErrorKind::PermissionDenied, "no access"),
            });
        }
        let route: Route = Arc::new(Mutex::new(Some((sink, context))));
        self.routes
            .lock()
            .unwrap()
            .insert(location.into(), Arc::clone(&route));
        Ok(Box::new(ScriptedListener {
            location: location.into(),
            route,
            cancelled: Arc::clone(&self.cancelled),
        }))
    }
}

#[derive(Default)]
struct FakeStore {
    downloads: Mutex<Vec<ArtifactLocator>>,
}
impl ArtifactStore for FakeStore {
    fn download(&self, locator: &ArtifactLocator, dest: &Path) -> Result<(), DownloadError> {
        self.downloads.lock().unwrap().push(locator.clone());
        fs::write(dest, locator.object.as_bytes()).map_err(|source| DownloadError::Write {
            path: dest.to_path_buf(),
            source,
        })
    }
}

#[derive(Default)]
struct FakeFlasher {
    /// Port, images, and whether every image was on disk when flashing.
    calls: Mutex<Vec<(String, Vec<FlashImage>, bool)>>,
    exit_code: i32,
}
impl Flasher for FakeFlasher {
    fn flash(&self, port: &str, images: &[FlashImage]) -> Result<(), FlashError> {
        let present = images.iter().all(|i| i.path.is_file());
        self.calls
            .lock()
            .unwrap()
            .push((port.into(), images.to_vec(), present));
        match self.exit_code {
            0 => Ok(()),
            code => Err(FlashError::Failed { code }),
        }
    }
}

struct Rig {
    provisioner: Provisioner,
    dispatcher: Arc<FakeDispatcher>,
    stream: Arc<ScriptedStream>,
    store: Arc<FakeStore>,
    flasher: Arc<FakeFlasher>,
    staging: TempDir,
}

fn rig_with(
    dispatcher: FakeDispatcher,
    stream: ScriptedStream,
    flasher: FakeFlasher,
    build_timeout: Option<Duration>,
) -> Rig {
    let staging = TempDir::new().unwrap();
    let settings = SettingsBuilder::new()
        .staging_root(staging.path())
        .build_timeout(build_timeout)
        .finalize();
    let dispatcher = Arc::new(dispatcher);
    let stream = Arc::new(stream);
    let store = Arc::new(FakeStore::default());
    let flasher = Arc::new(flasher);
    let provisioner = Provisioner::new(
        settings,
        dispatcher.clone(),
        stream.clone(),
        store.clone(),
        flasher.clone(),
    );
    Rig {
        provisioner,
        dispatcher,
        stream,
        store,
        flasher,
        staging,
    }
}

fn rig() -> Rig {
    rig_with(
        FakeDispatcher::default(),
        ScriptedStream::default(),
        FakeFlasher::default(),
        None,
    )
}

fn request(kind: JobKind, run_id: &str) -> JobRequest {
    JobRequest {
        kind,
        owner: "uid-7".into(),
        target_serial: "000006".into(),
        port: "/dev/ttyUSB0".into(),
        run_id: Some(JobId::new(run_id)),
        parameters: BTreeMap::new(),
    }
}

/// Follows the updates of `kind` until its guard is released and returns the
/// terminal phase the job went through.
fn wait_for_release(updates: &Receiver<StatusUpdate>, kind: JobKind) -> JobPhase {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut terminal = None;
    loop {
        let left = deadline
            .checked_duration_since(Instant::now())
            .expect("job did not finish in time");
        let update = updates.recv_timeout(left).expect("job did not finish in time");
        if update.kind != kind {
            continue;
        }
        if update.phase.is_terminal() {
            terminal = Some(update.phase);
        } else if update.phase == JobPhase::Idle && terminal.is_some() {
            return terminal.unwrap();
        }
    }
}

// Tests =======================================================================

#[test]
fn completed_build_is_flashed_and_released() {
    let rig = rig();
    let updates = rig.provisioner.watch();

    let run = rig
        .provisioner
        .execute(request(JobKind::Params, "run-1"))
        .unwrap();
    assert_eq!(run, JobId::new("run-1"));
    assert!(rig.provisioner.is_in_progress(JobKind::Params));
    assert_eq!(rig.stream.locations(), vec!["logs/000006/uid-7/run-1"]);

    assert!(rig.stream.push(JobKind::Params, json!({"status": "compiling"})));
    assert!(rig.stream.push(
        JobKind::Params,
        json!({"status": "completed", "path": "gs://fw-bucket/out/run-1.ino.bin"})
    ));

    assert_eq!(wait_for_release(&updates, JobKind::Params), JobPhase::Finalized);
    assert_eq!(rig.provisioner.status(JobKind::Params), "Finalized");
    assert!(!rig.provisioner.is_in_progress(JobKind::Params));

    let calls = rig.flasher.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    let (port, images, present) = &calls[0];
    assert_eq!(port, "/dev/ttyUSB0");
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].offset, FIRMWARE_OFFSET);
    assert!(present);

    assert!(!rig.staging.path().join("params").join("run-1").exists());
    assert_eq!(rig.stream.cancelled(), vec!["logs/000006/uid-7/run-1"]);

    // The kind is free again for the next job
    rig.provisioner
        .execute(request(JobKind::Params, "run-2"))
        .unwrap();
    assert_eq!(
        rig.provisioner.current_job(JobKind::Params),
        Some(JobId::new("run-2"))
    );
    rig.stream.push(
        JobKind::Params,
        json!({"status": "completed", "path": "fw-bucket/out/run-2.ino.bin"}),
    );
    assert_eq!(wait_for_release(&updates, JobKind::Params), JobPhase::Finalized);
    assert_eq!(rig.flasher.calls.lock().unwrap().len(), 2);
}

#[test]
fn statuses_follow_the_job_phases() {
    let rig = rig();
    let updates = rig.provisioner.watch();

    rig.provisioner
        .execute(request(JobKind::Params, "run-1"))
        .unwrap();
    rig.stream.push(JobKind::Params, json!({"status": "success"}));
    rig.stream.push(
        JobKind::Params,
        json!({"status": "completed", "binary_path": "fw-bucket/run-1.ino.bin"}),
    );

    let mut seen = vec![];
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if let Ok(update) = updates.recv_timeout(Duration::from_millis(100)) {
            seen.push((update.phase, update.status));
            if update.phase == JobPhase::Idle {
                break;
            }
        }
    }
    let expected: Vec<(JobPhase, String)> = vec![
        (JobPhase::Dispatching, "Compiling firmware..."),
        (JobPhase::RemoteBuilding, "Compiling firmware..."),
        (JobPhase::RemoteBuilding, "Success"),
        (JobPhase::RemoteBuilding, "completed"),
        (JobPhase::Provisioning, "Downloading binary..."),
        (JobPhase::Provisioning, "Programming device..."),
        (JobPhase::Finalized, "Finalized"),
        (JobPhase::Idle, "Finalized"),
    ]
    .into_iter()
    .map(|(phase, status)| (phase, status.to_string()))
    .collect();
    assert_eq!(seen, expected);
}

#[test]
fn set_serial_rewrites_the_full_flash_layout() {
    let rig = rig();
    let updates = rig.provisioner.watch();

    rig.provisioner
        .execute(request(JobKind::SetSerial, "run-9"))
        .unwrap();
    rig.stream.push(
        JobKind::SetSerial,
        json!({"status": "completed", "path": "gs://fw-bucket/out/serial.ino.bin"}),
    );
    assert_eq!(
        wait_for_release(&updates, JobKind::SetSerial),
        JobPhase::Finalized
    );

    let downloaded: Vec<String> = rig
        .store
        .downloads
        .lock()
        .unwrap()
        .iter()
        .map(|l| l.object.clone())
        .collect();
    assert_eq!(
        downloaded,
        vec![
            "out/serial.ino.bin",
            "out/serial.ino.bootloader.bin",
            "out/serial.ino.partitions.bin",
        ]
    );

    let calls = rig.flasher.calls.lock().unwrap().clone();
    let offsets: Vec<u32> = calls[0].1.iter().map(|i| i.offset).collect();
    assert_eq!(
        offsets,
        vec![BOOTLOADER_OFFSET, PARTITION_TABLE_OFFSET, FIRMWARE_OFFSET]
    );
}

#[test]
fn build_parameters_identify_the_job() {
    let rig = rig();
    let mut req = request(JobKind::Params, "run-1");
    req.parameters.insert("TARIFA".into(), "3".into());
    rig.provisioner.execute(req).unwrap();

    let requests = rig.dispatcher.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    let parameters = &requests[0].parameters;
    assert_eq!(parameters["TARIFA"], "3");
    assert_eq!(parameters["USER"], "uid-7");
    assert_eq!(parameters["UUID"], "run-1");
    assert_eq!(parameters["SERIAL"], "000006");
    assert_eq!(requests[0].args, vec!["/workspace/compile_and_upload.py"]);

    rig.stream.push(JobKind::Params, json!({"status": "failed"}));
}

#[test]
fn deliveries_carry_the_job_context() {
    let rig = rig();
    let run = rig
        .provisioner
        .execute(request(JobKind::SetSerial, "run-3"))
        .unwrap();

    let contexts = rig.stream.contexts();
    assert_eq!(
        contexts,
        vec![JobContext {
            kind: JobKind::SetSerial,
            job_id: run,
            port: "/dev/ttyUSB0".into(),
        }]
    );
    rig.stream.push(JobKind::SetSerial, json!({"status": "failed"}));
}

#[test]
fn second_job_of_a_kind_is_refused_while_in_flight() {
    let rig = rig();
    let updates = rig.provisioner.watch();

    rig.provisioner
        .execute(request(JobKind::Params, "run-1"))
        .unwrap();
    let refused = rig.provisioner.execute(request(JobKind::Params, "run-2"));
    assert!(matches!(
        refused,
        Err(ProvisionError::ConcurrencyConflict(JobKind::Params))
    ));
    // The refused request never reached the build service
    assert_eq!(rig.dispatcher.requests.lock().unwrap().len(), 1);
    assert_eq!(
        rig.provisioner.current_job(JobKind::Params),
        Some(JobId::new("run-1"))
    );

    rig.stream.push(JobKind::Params, json!({"status": "failed"}));
    assert_eq!(wait_for_release(&updates, JobKind::Params), JobPhase::Error);
    assert!(rig
        .provisioner
        .execute(request(JobKind::Params, "run-2"))
        .is_ok());
    rig.stream.push(JobKind::Params, json!({"status": "failed"}));
}

#[test]
fn jobs_of_different_kinds_run_side_by_side() {
    let rig = rig();
    let updates = rig.provisioner.watch();

    rig.provisioner
        .execute(request(JobKind::Params, "run-1"))
        .unwrap();
    rig.provisioner
        .execute(request(JobKind::SetSerial, "run-2"))
        .unwrap();
    assert!(rig.provisioner.is_in_progress(JobKind::Params));
    assert!(rig.provisioner.is_in_progress(JobKind::SetSerial));

    rig.stream.push(
        JobKind::SetSerial,
        json!({"status": "completed", "path": "fw-bucket/run-2.ino.bin"}),
    );
    assert_eq!(
        wait_for_release(&updates, JobKind::SetSerial),
        JobPhase::Finalized
    );
    assert!(rig.provisioner.is_in_progress(JobKind::Params));
    assert!(!rig.provisioner.phase(JobKind::Params).is_terminal());

    rig.stream.push(JobKind::Params, json!({"status": "blocked"}));
    assert_eq!(wait_for_release(&updates, JobKind::Params), JobPhase::Error);
}

#[test]
fn failed_build_never_downloads_or_flashes() {
    let rig = rig();
    let updates = rig.provisioner.watch();

    rig.provisioner
        .execute(request(JobKind::Params, "run-1"))
        .unwrap();
    rig.stream.push(
        JobKind::Params,
        json!({"status": "failed", "message": "sketch does not compile"}),
    );

    assert_eq!(wait_for_release(&updates, JobKind::Params), JobPhase::Error);
    let status = rig.provisioner.status(JobKind::Params);
    assert!(status.starts_with("Error:"), "{}", status);
    assert!(status.contains("sketch does not compile"), "{}", status);
    assert!(rig.store.downloads.lock().unwrap().is_empty());
    assert!(rig.flasher.calls.lock().unwrap().is_empty());
    assert_eq!(rig.stream.cancelled(), vec!["logs/000006/uid-7/run-1"]);
    // The cancelled listener delivers nothing any more
    assert!(!rig.stream.push(JobKind::Params, json!({"status": "completed"})));
}

#[test]
fn deliveries_for_other_jobs_are_ignored() {
    let rig = rig();
    let updates = rig.provisioner.watch();

    rig.provisioner
        .execute(request(JobKind::Params, "run-1"))
        .unwrap();
    rig.stream.push_foreign(JobKind::Params, json!({"status": "failed"}));
    rig.stream.push(
        JobKind::Params,
        json!({"status": "completed", "path": "fw-bucket/run-1.ino.bin"}),
    );
    assert_eq!(wait_for_release(&updates, JobKind::Params), JobPhase::Finalized);
}

#[test]
fn completed_without_artifact_is_an_error() {
    let rig = rig();
    let updates = rig.provisioner.watch();

    rig.provisioner
        .execute(request(JobKind::Params, "run-1"))
        .unwrap();
    rig.stream.push(JobKind::Params, json!({"status": "completed"}));

    assert_eq!(wait_for_release(&updates, JobKind::Params), JobPhase::Error);
    assert!(rig.store.downloads.lock().unwrap().is_empty());
    assert!(rig.flasher.calls.lock().unwrap().is_empty());
}

#[test]
fn flashing_failure_is_an_error_and_cleans_up() {
    let rig = rig_with(
        FakeDispatcher::default(),
        ScriptedStream::default(),
        FakeFlasher {
            exit_code: 2,
            ..Default::default()
        },
        None,
    );
    let updates = rig.provisioner.watch();

    rig.provisioner
        .execute(request(JobKind::Params, "run-1"))
        .unwrap();
    rig.stream.push(
        JobKind::Params,
        json!({"status": "completed", "path": "fw-bucket/run-1.ino.bin"}),
    );

    assert_eq!(wait_for_release(&updates, JobKind::Params), JobPhase::Error);
    let status = rig.provisioner.status(JobKind::Params);
    assert!(status.starts_with("Error:"), "{}", status);
    assert!(!rig.staging.path().join("params").join("run-1").exists());
    assert!(!rig.provisioner.is_in_progress(JobKind::Params));
}

#[test]
fn rejected_build_is_reported_to_the_caller() {
    let rig = rig_with(
        FakeDispatcher {
            reject: true,
            ..Default::default()
        },
        ScriptedStream::default(),
        FakeFlasher::default(),
        None,
    );

    let result = rig.provisioner.execute(request(JobKind::Params, "run-1"));
    assert!(matches!(
        result,
        Err(ProvisionError::Dispatch(DispatchError::Rejected(_)))
    ));
    assert!(!rig.provisioner.is_in_progress(JobKind::Params));
    assert!(rig
        .provisioner
        .status(JobKind::Params)
        .starts_with("Error:"));
    assert!(rig.stream.locations().is_empty());
}

#[test]
fn subscription_failure_is_reported_to_the_caller() {
    let rig = rig_with(
        FakeDispatcher::default(),
        ScriptedStream {
            refuse: true,
            ..Default::default()
        },
        FakeFlasher::default(),
        None,
    );

    let result = rig.provisioner.execute(request(JobKind::SetSerial, "run-1"));
    assert!(matches!(result, Err(ProvisionError::Subscription(_))));
    assert!(!rig.provisioner.is_in_progress(JobKind::SetSerial));
    assert_eq!(rig.provisioner.phase(JobKind::SetSerial), JobPhase::Idle);
}

#[test]
fn silent_build_times_out() {
    let rig = rig_with(
        FakeDispatcher::default(),
        ScriptedStream::default(),
        FakeFlasher::default(),
        Some(Duration::from_millis(200)),
    );
    let updates = rig.provisioner.watch();

    rig.provisioner
        .execute(request(JobKind::Params, "run-1"))
        .unwrap();
    assert_eq!(wait_for_release(&updates, JobKind::Params), JobPhase::Error);
    assert!(rig
        .provisioner
        .status(JobKind::Params)
        .contains("no build result"));
    assert_eq!(rig.stream.cancelled(), vec!["logs/000006/uid-7/run-1"]);
}

#[test]
fn incomplete_request_is_refused_without_taking_the_guard() {
    let rig = rig();
    let mut req = request(JobKind::Params, "run-1");
    req.port = "  ".into();

    let result = rig.provisioner.execute(req);
    assert!(matches!(result, Err(ProvisionError::InvalidRequest(_))));
    assert!(!rig.provisioner.is_in_progress(JobKind::Params));
    assert_eq!(rig.provisioner.status(JobKind::Params), "Ready");
    assert!(rig.dispatcher.requests.lock().unwrap().is_empty());
}

#[test]
fn run_id_is_generated_when_missing() {
    let rig = rig();
    let mut req = request(JobKind::Params, "unused");
    req.run_id = None;

    let run = rig.provisioner.execute(req).unwrap();
    assert!(!run.as_str().is_empty());
    assert_ne!(run, JobId::new("unused"));
    assert_eq!(rig.provisioner.current_job(JobKind::Params), Some(run));
    rig.stream.push(JobKind::Params, json!({"status": "failed"}));
}

#[test]
fn run_id_in_use_by_another_kind_is_refused() {
    let rig = rig();
    let updates = rig.provisioner.watch();

    rig.provisioner
        .execute(request(JobKind::SetSerial, "run-1"))
        .unwrap();
    let refused = rig.provisioner.execute(request(JobKind::Params, "run-1"));
    assert!(matches!(refused, Err(ProvisionError::InvalidRequest(_))));
    assert!(!rig.provisioner.is_in_progress(JobKind::Params));
    assert_eq!(rig.dispatcher.requests.lock().unwrap().len(), 1);

    rig.stream.push(
        JobKind::SetSerial,
        json!({"status": "completed", "path": "fw-bucket/run-1.ino.bin"}),
    );
    assert_eq!(
        wait_for_release(&updates, JobKind::SetSerial),
        JobPhase::Finalized
    );
    let calls = rig.flasher.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].2, "images missing while flashing");

    // Once released, the run id may be reused by the other kind
    rig.provisioner
        .execute(request(JobKind::Params, "run-1"))
        .unwrap();
    rig.stream.push(JobKind::Params, json!({"status": "failed"}));
}

#[test]
fn blank_run_id_is_refused_and_other_runs_are_untouched() {
    let rig = rig();
    let other = rig.staging.path().join("params").join("other-run");
    fs::create_dir_all(&other).unwrap();
    fs::write(other.join("fw.bin"), b"fw").unwrap();

    for blank in &["", "   "] {
        let result = rig.provisioner.execute(request(JobKind::Params, blank));
        assert!(matches!(result, Err(ProvisionError::InvalidRequest(_))));
    }
    assert!(!rig.provisioner.is_in_progress(JobKind::Params));
    assert!(rig.dispatcher.requests.lock().unwrap().is_empty());
    assert!(other.join("fw.bin").is_file());
}

#[test]
fn crashing_dispatch_releases_the_guard() {
    let rig = rig_with(
        FakeDispatcher {
            crash: true,
            ..Default::default()
        },
        ScriptedStream::default(),
        FakeFlasher::default(),
        None,
    );

    let execute = |run: &str| {
        panic::catch_unwind(AssertUnwindSafe(|| {
            rig.provisioner.execute(request(JobKind::Params, run))
        }))
    };
    assert!(execute("run-1").is_err());
    assert!(!rig.provisioner.is_in_progress(JobKind::Params));
    assert!(rig
        .provisioner
        .status(JobKind::Params)
        .starts_with("Error:"));

    // The next attempt is admitted and reaches the build service again
    assert!(execute("run-2").is_err());
    assert_eq!(rig.dispatcher.requests.lock().unwrap().len(), 2);
    assert!(!rig.provisioner.is_in_progress(JobKind::Params));
}
