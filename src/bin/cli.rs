//! Taxiprov command line interface.

use std::{collections::BTreeMap, process, sync::Arc, time::Duration};

use clap::{
    crate_authors, crate_description, crate_name, crate_version, value_t, App, AppSettings::*,
    Arg, ArgMatches, SubCommand,
};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, trace, LevelFilter};
use simplelog::*;

use taxiprov::{
    self as tp, utils, ArtifactStore, ChangeStream, JobDispatcher, JobId, JobKind, JobPhase,
    JobRequest, Provisioner, Settings, TokenSource,
};

fn main() {
    println!("[TP] taxiprov v{}", crate_version!());

    // Values missing from the command line may come from a `.env` file
    let dotenv = dotenvy::dotenv();

    if let Err(e) = ctrlc::set_handler(move || {
        println!("🛑 received Ctrl+C!");
        process::exit(130);
    }) {
        eprintln!("{}: failed to install the Ctrl+C handler: {}", style("error").red(), e);
    }

    let matches = App::new(crate_name!())
        .version(format!("v{}", crate_version!()).as_str())
        .author(crate_authors!())
        .about(crate_description!())
        .long_about(
            "\n\
            Taxiprov provisions taximeter boards attached over a USB serial \
            adapter. A provisioning job goes through the following steps:\n\
               \t* reset the board and read its serial number from the boot \
            banner\n\
               \t* submit a firmware build for that board to the remote build \
            service\n\
               \t* follow the build log until the build completes or fails\n\
               \t* download the built image(s) from the artifact bucket\n\
               \t* flash the image(s) onto the board\n\
            \n\
            `params` jobs write the application image only, `set_serial` \
            jobs also rewrite the bootloader and the partition table.\
        ",
        )
        .max_term_width(80)
        .setting(ColoredHelp)
        .setting(NextLineHelp)
        .setting(SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("v")
                .short("v")
                .multiple(true)
                .global(true)
                .help(
                    "Sets the logging level of verbosity, repeat several times for \
                     higher verbosity",
                ),
        )
        .subcommand(SubCommand::with_name("ports").about("list the recognized USB serial adapters"))
        .subcommand(
            SubCommand::with_name("serial")
                .about("read the serial number announced by the board")
                .arg(tty_arg().required(true))
                .arg(baud_rate_arg()),
        )
        .subcommand(
            SubCommand::with_name("provision")
                .about("build and flash the firmware of the board")
                .arg(tty_arg())
                .arg(baud_rate_arg())
                .arg(
                    Arg::with_name("KIND")
                        .help("the kind of job to run")
                        .long("--kind")
                        .takes_value(true)
                        .possible_values(&["params", "set_serial"])
                        .default_value("params")
                        .require_equals(true),
                )
                .arg(
                    Arg::with_name("OWNER")
                        .help("the operator running the job")
                        .long("--owner")
                        .env("TAXIPROV_OWNER")
                        .takes_value(true)
                        .required(true)
                        .require_equals(true),
                )
                .arg(
                    Arg::with_name("SERIAL")
                        .help("the serial number of the board")
                        .long_help(
                            "the serial number of the board; when not set, the \
                             board is reset and the serial number is read from \
                             its boot banner.",
                        )
                        .long("--serial")
                        .takes_value(true)
                        .require_equals(true),
                )
                .arg(
                    Arg::with_name("RUN_ID")
                        .help("the run identifier of the job; generated when not set")
                        .long("--run-id")
                        .takes_value(true)
                        .require_equals(true),
                )
                .arg(
                    Arg::with_name("PARAM")
                        .help("an extra build parameter, passed as KEY=VALUE")
                        .short("-P")
                        .long("--param")
                        .takes_value(true)
                        .multiple(true)
                        .number_of_values(1),
                )
                .arg(
                    Arg::with_name("CREDENTIALS")
                        .help("the service account key file")
                        .long("--credentials")
                        .env("GOOGLE_APPLICATION_CREDENTIALS")
                        .takes_value(true)
                        .require_equals(true),
                )
                .arg(
                    Arg::with_name("DISPATCH")
                        .help("how build requests are submitted")
                        .long_help(
                            "how build requests are submitted: `api` calls the \
                             job service REST API, `gcloud` runs the gcloud \
                             command line tool.",
                        )
                        .long("--dispatch")
                        .env("TAXIPROV_DISPATCH")
                        .takes_value(true)
                        .possible_values(&["api", "gcloud"])
                        .default_value("api")
                        .require_equals(true),
                )
                .arg(
                    Arg::with_name("BUILD_TIMEOUT")
                        .help("fail builds not done after this many seconds")
                        .long("--build-timeout")
                        .env("TAXIPROV_BUILD_TIMEOUT")
                        .takes_value(true)
                        .require_equals(true),
                ),
        )
        .get_matches();

    // Vary the output based on how many times the user used the "verbose" flag
    // (i.e. 'taxiprov -v -v -v' or 'taxiprov -vvv' vs 'taxiprov -v'
    let verbosity = matches.occurrences_of("v").max(
        matches
            .subcommand()
            .1
            .map_or(0, |sub| sub.occurrences_of("v")),
    );
    let log_level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    if let Err(e) = TermLogger::init(
        log_level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    ) {
        eprintln!("{}: failed to set up logging: {}", style("error").red(), e);
    }

    trace!("{:#?}", matches);
    if let Err(e) = dotenv {
        debug!("no .env file loaded: {}", e);
    }

    let exit_code = match matches.subcommand() {
        ("ports", Some(_)) => list_ports(),
        ("serial", Some(sub)) => read_serial(sub),
        ("provision", Some(sub)) => provision(sub),
        _ => unreachable!(),
    };
    debug!("exit code: {}", exit_code);
    process::exit(exit_code);
}

// Subcommands =================================================================

fn list_ports() -> i32 {
    let settings = tp::SettingsBuilder::default().finalize();
    let ports = tp::list_ports(&settings.known_ports);
    if ports.is_empty() {
        println!("[TP] no recognized USB serial adapter connected");
        return 1;
    }
    for port in ports {
        println!(
            "{}  {}  {}",
            style(&port.device_path).green(),
            port.description,
            style(&port.hardware_id).dim()
        );
    }
    0
}

fn read_serial(matches: &ArgMatches) -> i32 {
    let settings = settings_from(matches);
    let port = match matches.value_of("DEVICE_TTY") {
        Some(port) => port,
        None => unreachable!(),
    };
    match read_serial_with_retry(port, &settings) {
        Some(serial) => {
            println!("{}", serial);
            0
        }
        None => 1,
    }
}

fn provision(matches: &ArgMatches) -> i32 {
    let settings = settings_from(matches);

    // Arguments with default values ===========================================

    let kind = value_t!(matches.value_of("KIND"), JobKind).unwrap_or_else(|e| e.exit());
    let use_gcloud = matches.value_of("DISPATCH") == Some("gcloud");

    // START - Arguments with NO default values ================================

    let owner = matches.value_of("OWNER").unwrap_or_default().to_owned();
    let run_id = matches.value_of("RUN_ID").map(JobId::new);
    let mut parameters = BTreeMap::new();
    for param in matches.values_of("PARAM").into_iter().flatten() {
        match param.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                parameters.insert(key.trim().to_owned(), value.to_owned());
            }
            _ => {
                println!(
                    "{}: `{}` needs to be KEY=VALUE",
                    style("error").red(),
                    style(param).on_red()
                );
                return 2;
            }
        }
    }

    // END - Arguments =========================================================

    let port = match matches.value_of("DEVICE_TTY") {
        Some(path) => {
            if utils::wait_for_port(path, &settings.known_ports) {
                return 1;
            }
            path.to_owned()
        }
        None => loop {
            if let Some(path) = utils::select_port(&settings.known_ports) {
                break path;
            }
        },
    };

    let target_serial = match matches.value_of("SERIAL") {
        Some(serial) => serial.to_owned(),
        None => match read_serial_with_retry(&port, &settings) {
            Some(serial) => serial,
            None => return 1,
        },
    };
    println!(
        "[TP] board {} on {}",
        style(&target_serial).cyan(),
        style(&port).cyan()
    );

    let tokens: Arc<dyn TokenSource> = match std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN") {
        Ok(token) if !token.is_empty() => Arc::new(tp::StaticToken::new(token)),
        _ => Arc::new(tp::GcloudToken::new(settings.credentials.clone())),
    };
    let dispatcher: Arc<dyn JobDispatcher> = if use_gcloud {
        Arc::new(tp::GcloudCli::new(settings.credentials.clone()))
    } else {
        Arc::new(tp::CloudRunApi::new(Arc::clone(&tokens)))
    };
    let stream: Arc<dyn ChangeStream> = Arc::new(tp::FirestorePoller::new(
        &settings.service.project,
        Arc::clone(&tokens),
        settings.poll_interval,
    ));
    let store: Arc<dyn ArtifactStore> = Arc::new(tp::GcsStore::new(tokens));
    let flasher = Arc::new(tp::Esptool::new(
        settings.flash_tool.as_str(),
        settings.flash_chip.as_str(),
        settings.flash_baud_rate,
    ));

    let provisioner = Provisioner::new(settings, dispatcher, stream, store, flasher);
    let updates = provisioner.watch();
    let run_id = match provisioner.execute(JobRequest {
        kind,
        owner,
        target_serial,
        port,
        run_id,
        parameters,
    }) {
        Ok(run_id) => run_id,
        Err(e) => {
            println!("{}: {}", style("error").red(), e);
            return 1;
        }
    };
    info!("run {} started", run_id);

    let pb = ProgressBar::new_spinner();
    pb.enable_steady_tick(120);
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_strings(&["⠋", "⠙", "⠚", "⠞", "⠖", "⠦", "⠴", "⠲", "⠳", "⠓"])
            .template("[TP] {spinner:.blue} {msg}"),
    );

    // Follow the job until its guard is released after a terminal status
    let mut outcome = None;
    for update in updates.iter().filter(|u| u.kind == kind) {
        pb.set_message(update.status.clone());
        if update.phase.is_terminal() {
            outcome = Some(update.phase);
        } else if update.phase == JobPhase::Idle && outcome.is_some() {
            break;
        }
    }

    match outcome {
        Some(JobPhase::Finalized) => {
            pb.finish_with_message(format!("👍 {} provisioned", style(&run_id).green()));
            0
        }
        _ => {
            pb.finish_with_message(format!(
                "❌ {}",
                style(provisioner.status(kind)).red()
            ));
            1
        }
    }
}

// Helpers =====================================================================

fn tty_arg<'a, 'b>() -> Arg<'a, 'b> {
    Arg::with_name("DEVICE_TTY")
        .help("the USB tty device of the board")
        .long_help(
            "the USB tty device of the board; when not set, the connected \
             USB serial adapters are offered for selection.",
        )
        .short("-t")
        .long("--tty")
        .env("TAXIPROV_TTY")
        .takes_value(true)
        .require_equals(true)
}

fn baud_rate_arg<'a, 'b>() -> Arg<'a, 'b> {
    Arg::with_name("BAUD_RATE")
        .help("serial port baud rate used to read the serial number")
        .short("-b")
        .long("--baud-rate")
        .takes_value(true)
        .default_value("115200")
        .require_equals(true)
}

fn settings_from(matches: &ArgMatches) -> Settings {
    let baud_rate = value_t!(matches.value_of("BAUD_RATE"), u32).unwrap_or_else(|_| {
        println!(
            "{}: `{}` needs to be a numeric value",
            style("error").red(),
            style("baud-rate").cyan()
        );
        process::exit(2);
    });

    let mut builder = tp::SettingsBuilder::default().baud_rate(baud_rate);
    if let Some(path) = matches.value_of("CREDENTIALS") {
        builder = builder.credentials(path);
    }
    if matches.is_present("BUILD_TIMEOUT") {
        let seconds = value_t!(matches.value_of("BUILD_TIMEOUT"), u64).unwrap_or_else(|_| {
            println!(
                "{}: `{}` needs to be a number of seconds",
                style("error").red(),
                style("build-timeout").cyan()
            );
            process::exit(2);
        });
        builder = builder.build_timeout(Some(Duration::from_secs(seconds)));
    }
    builder.finalize()
}

/// The board sometimes misses the reset pulse right after being plugged in,
/// give it a few chances.
fn read_serial_with_retry(port: &str, settings: &Settings) -> Option<String> {
    use retry::{delay, retry_with_index};

    let result = retry_with_index(delay::Fixed::from_millis(1000).take(2), |index| {
        debug!("Reading the serial number, attempt {}", index);
        match tp::handshake(&tp::SerialOpener, port, settings) {
            Ok(Some(serial)) => Ok(serial),
            Ok(None) => Err(format!(
                "no `{}` line within {:?}",
                settings.serial_keyword, settings.handshake_timeout
            )),
            Err(e) => Err(e.to_string()),
        }
    });
    match result {
        Ok(serial) => Some(serial),
        Err(retry::Error::Operation { error, tries, .. }) => {
            error!("Failed to read the serial number after {} tries: {}", tries, error);
            println!("{}: {}", style("error").red(), error);
            None
        }
        Err(retry::Error::Internal(e)) => {
            error!("Internal retry error while reading the serial number: {}", e);
            None
        }
    }
}
