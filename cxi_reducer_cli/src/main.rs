use clap::{Arg, ArgAction, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::time::Duration;

use libcxi_reducer::config::Config;
use libcxi_reducer::process::run;
use libcxi_reducer::reader_status::ReaderStatus;

fn make_template_config(path: &Path) {
    let config = Config::default();
    let yaml_str = serde_yaml::to_string(&config).unwrap();
    let mut file = File::create(path).expect("Could not create template config file!");
    file.write_all(yaml_str.as_bytes())
        .expect("Failed to write yaml data to file!");
}

fn main() {
    // Create a cli
    let matches = Command::new("cxi_reducer_cli")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .help("Path to the configuration file"),
        )
        .arg(
            Arg::new("run-nr")
                .long("run-nr")
                .help("Run number")
                .value_parser(clap::value_parser!(i32)),
        )
        .arg(
            Arg::new("dark-nr")
                .long("dark-nr")
                .help("Run number of dark")
                .value_parser(clap::value_parser!(i32)),
        )
        .arg(
            Arg::new("hitscore-threshold")
                .long("hitscore-threshold")
                .help("Hitscore threshold")
                .value_parser(clap::value_parser!(f64)),
        )
        .arg(
            Arg::new("multiscore-threshold")
                .long("multiscore-threshold")
                .help("Multiscore threshold")
                .value_parser(clap::value_parser!(f64)),
        )
        .arg(
            Arg::new("gain-lvl")
                .long("gain-lvl")
                .help("Gain level of pnccds")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("output-level")
                .long("output-level")
                .help("Output level (0: dry run, 1: small data for all hits, 2: tof data for hits, 3: pnccd data for hits, 4: all data for multiple hits)")
                .value_parser(clap::value_parser!(u8)),
        )
        .arg(
            Arg::new("outdir")
                .long("outdir")
                .help("Output directory different from default (optional)"),
        )
        .arg(
            Arg::new("nr-frames")
                .long("nr-frames")
                .help("Number of frames")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("skip-tof")
                .long("skip-tof")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("only-save-multiples")
                .long("only-save-multiples")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    // Initialize feedback: terminal + log file behind the progress bars
    let stamp = time::OffsetDateTime::now_utc()
        .format(time::macros::format_description!(
            "[year][month][day]_[hour][minute][second]"
        ))
        .unwrap_or_else(|_| String::from("unknown"));
    let log_path = format!("cxi_reducer_{stamp}.log");
    let logger = simplelog::CombinedLogger::new(vec![
        simplelog::TermLogger::new(
            simplelog::LevelFilter::Info,
            simplelog::Config::default(),
            simplelog::TerminalMode::Mixed,
            simplelog::ColorChoice::Auto,
        ),
        simplelog::WriteLogger::new(
            simplelog::LevelFilter::Info,
            simplelog::Config::default(),
            File::create(&log_path).expect("Could not create log file!"),
        ),
    ]);

    let pb_manager = MultiProgress::new();

    LogWrapper::new(pb_manager.clone(), logger)
        .try_init()
        .expect("Could not create logging/progress!");
    log::set_max_level(log::LevelFilter::Info);

    // Parse the cli
    let config_path = PathBuf::from(matches.get_one::<String>("path").expect("We require args"));

    if let Some(("new", _)) = matches.subcommand() {
        log::info!(
            "Making a template config at {}...",
            config_path.to_string_lossy()
        );

        make_template_config(&config_path);
        log::info!("Done.");
        return;
    }

    // Load our config
    log::info!("Loading config from {}...", config_path.to_string_lossy());
    let mut config = match Config::read_config_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    };

    // Command-line overrides beat the file and the run parameter table
    if let Some(run_nr) = matches.get_one::<i32>("run-nr") {
        config.run_number = *run_nr;
    }
    if let Some(dark_nr) = matches.get_one::<i32>("dark-nr") {
        config.dark_number = Some(*dark_nr);
    }
    if let Some(threshold) = matches.get_one::<f64>("hitscore-threshold") {
        config.hitscore_threshold = Some(*threshold);
    }
    if let Some(threshold) = matches.get_one::<f64>("multiscore-threshold") {
        config.multiscore_threshold = Some(*threshold);
    }
    if let Some(gain) = matches.get_one::<i64>("gain-lvl") {
        config.gain_level = Some(*gain);
    }
    if let Some(level) = matches.get_one::<u8>("output-level") {
        config.output_level = *level;
    }
    if let Some(outdir) = matches.get_one::<String>("outdir") {
        config.output_dir = PathBuf::from(outdir);
    }
    if let Some(frames) = matches.get_one::<u64>("nr-frames") {
        config.nr_frames = Some(*frames);
    }
    if matches.get_flag("skip-tof") {
        config.skip_tof = true;
    }
    if matches.get_flag("only-save-multiples") {
        config.only_save_multiples = true;
    }

    log::info!("Config successfully loaded.");
    log::info!("Facility: {}", config.facility);
    log::info!("Run: {} Dark: {:?}", config.run_number, config.dark_number);
    log::info!("Output Path: {}", config.output_dir.to_string_lossy());
    log::info!("Output Level: {}", config.output_level);
    log::info!("Number of Readers: {}", config.n_readers);

    // Setup the progress channel
    let (tx, rx) = channel::<ReaderStatus>();
    let run_config = config.clone();
    // Spawn the task!
    let handle = std::thread::spawn(move || run(&run_config, &tx));

    let bar_style = ProgressStyle::with_template("reader {prefix}: {bar:40} {pos}% {msg}")
        .expect("Could not create progress style!");
    let mut bars: HashMap<usize, ProgressBar> = HashMap::new();
    loop {
        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(status) => {
                let bar = bars.entry(status.rank).or_insert_with(|| {
                    let bar = pb_manager.add(ProgressBar::new(100));
                    bar.set_style(bar_style.clone());
                    bar.set_prefix(status.rank.to_string());
                    bar
                });
                bar.set_position((status.progress.max(0.0) * 100.0) as u64);
                bar.set_message(format!("{} events, {} hits", status.events, status.hits));
            }
            Err(RecvTimeoutError::Timeout) => {
                if handle.is_finished() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    for bar in bars.values() {
        bar.finish();
    }

    match handle.join() {
        Ok(result) => match result {
            Ok(summary) => {
                log::info!("Successfully reduced run data!");
                log::info!(
                    "{} events processed, {} hits, {} records written, {} frames in file.",
                    summary.events,
                    summary.hits,
                    summary.records_written,
                    summary.n_frames
                );
                if let Some(median) = summary.median_hitscore {
                    log::info!("Median hit score: {:.1}", median);
                }
            }
            Err(e) => {
                log::error!("Reduction failed with error: {e}");
                std::process::exit(1);
            }
        },
        Err(_) => {
            log::error!("Failed to join reduction task!");
            std::process::exit(1);
        }
    }

    log::info!("Done.");
}
