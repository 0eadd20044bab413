//! # cxi_reducer
//!
//! cxi_reducer is an offline hit-reduction pipeline for FEL imaging
//! beamtimes, written in Rust. Several reader processes pull acquisition
//! events (pnccd detector frames, TOF traces, and auxiliary channel data)
//! from a facility translator, score each event for hits and multi-hits,
//! and append the selected, reduced records to one shared CXI-style HDF5
//! file per run.
//!
//! The hard part is the coordination: every reader buffers its gated
//! records locally and flushes fixed-size chunks into slot ranges it
//! reserved beforehand, so concurrent flushes never overlap on disk. The
//! close is two-phase (flush everywhere, then a barrier), after which the
//! designated main reader alone finalizes the file: stable `data_1`/`data_2`
//! aliases, axis metadata, a frame-count summary, and an atomic rename from
//! the hidden temporary name to the published one.
//!
//! ## Configuration
//!
//! Configuration lives in a YAML file; the `new` subcommand of
//! `cxi_reducer_cli` writes a template. The YAML format is as follows:
//!
//! ```yml
//! facility: dummy
//! run_number: 0
//! dark_number: null
//! params_path: null
//! data_glob: null
//! calib_glob: null
//! daq_dir: null
//! motor_file: null
//! output_dir: None
//! output_level: 3
//! skip_tof: false
//! only_save_multiples: false
//! hitscore_threshold: null
//! multiscore_threshold: null
//! gain_level: null
//! nr_frames: null
//! n_readers: 1
//! chunk_size: 10
//! frame_shape:
//! - 64
//! - 64
//! dummy_n_events: 100
//! ```
//!
//! Thresholds and the pnccd gain level may also come from a per-run
//! parameter table (`params_path`, CSV); values set directly win. Output
//! levels: 0 dry run, 1 small data for all hits, 2 adds TOF traces, 3 adds
//! pnccd frames, 4 adds the multi-hit transform outputs.
//!
//! ## Output
//!
//! One file per run, named `r<run>_ol<level>.h5` (hidden `.r<run>_ol<level>.h5`
//! while the run is in flight). The layout is:
//!
//! ```text
//! r0016_ol3.h5
//! |---- entry_1
//! |    |---- event - bunch_id, tv_sec, tv_usec, dataset_id, bunch_sec
//! |    |---- motors - injectorx, injectory, ... (one row per hit)
//! |    |---- FEL - gmd, wavelength_nm
//! |    |---- result_1 - hitscore_litpixel, hitscore_litpixel_threshold,
//! |    |               multiscore_patterson, multiscore_patterson_threshold
//! |    |---- detector_1 - data(dset), mask(dset), patterson(dset)
//! |    |---- detector_2 - data(dset)
//! |    |---- data_1 -> /entry_1/detector_1 (soft link)
//! |    |---- data_2 -> /entry_1/detector_2 (soft link)
//! ```
//!
//! `detector_1`/`detector_2` and the aliases are present only from the
//! output level that includes them. Every per-event dataset has the event
//! dimension first; `detector_1/data` carries an `axes` attribute of
//! `experiment_identifier:y:x`.
pub mod analysis;
pub mod comm;
pub mod config;
pub mod cxi_writer;
pub mod error;
pub mod event_loop;
pub mod finalize;
pub mod gate;
pub mod params;
pub mod process;
pub mod reader_status;
pub mod record;
pub mod score_cache;
pub mod translator;
