use std::fs::File;
use std::io::Read;
use std::path::Path;

use super::error::ParamsError;

const ENTRIES_PER_LINE: usize = 7; //runNr,darkNr,hitscore,multiscore,gain,gapTop,gapBottom

/// One row of the per-run parameter table.
///
/// The table is maintained by the beamtime crew as a CSV file with *no*
/// whitespaces and one row per run:
///
/// ```csv
/// runNr,darkNr,hitscoreThreshold,multiscoreThreshold,pnccdGainLevel,pnccdGapTopMM,pnccdGapBottomMM
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RunParams {
    pub dark_nr: i32,
    pub hitscore_threshold: f64,
    pub multiscore_threshold: f64,
    pub gain_level: i64,
    pub gap_top_mm: f64,
    pub gap_bottom_mm: f64,
}

/// Look up the parameter row for a run number.
pub fn read_params(path: &Path, run_number: i32) -> Result<RunParams, ParamsError> {
    if !path.exists() {
        return Err(ParamsError::BadFilePath(path.to_path_buf()));
    }
    let mut contents = String::new();
    File::open(path)?.read_to_string(&mut contents)?;
    parse_params(&contents, run_number)
}

fn parse_params(contents: &str, run_number: i32) -> Result<RunParams, ParamsError> {
    let mut lines = contents.lines();
    lines.next(); // Skip the header
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let entries: Vec<&str> = line.split_terminator(',').collect();
        if entries.len() != ENTRIES_PER_LINE {
            return Err(ParamsError::BadFileFormat);
        }
        let run: i32 = entries[0].parse()?;
        if run != run_number {
            continue;
        }
        return Ok(RunParams {
            dark_nr: entries[1].parse()?,
            hitscore_threshold: entries[2].parse()?,
            multiscore_threshold: entries[3].parse()?,
            gain_level: entries[4].parse()?,
            gap_top_mm: entries[5].parse()?,
            gap_bottom_mm: entries[6].parse()?,
        });
    }
    Err(ParamsError::MissingRun(run_number))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "runNr,darkNr,hitscoreThreshold,multiscoreThreshold,pnccdGainLevel,pnccdGapTopMM,pnccdGapBottomMM\n\
                         16236,16230,220,200,16,1.2,0.8\n\
                         16237,16230,180,200,64,1.2,0.8\n";

    #[test]
    fn test_lookup() {
        let row = parse_params(TABLE, 16237).unwrap();
        assert_eq!(row.dark_nr, 16230);
        assert_eq!(row.hitscore_threshold, 180.0);
        assert_eq!(row.gain_level, 64);
        assert_eq!(row.gap_bottom_mm, 0.8);
    }

    #[test]
    fn test_missing_run() {
        match parse_params(TABLE, 99999) {
            Err(ParamsError::MissingRun(99999)) => (),
            other => panic!("expected MissingRun, got {other:?}"),
        }
    }

    #[test]
    fn test_bad_format() {
        let bad = "header\n16236,16230,220\n";
        assert!(matches!(
            parse_params(bad, 16236),
            Err(ParamsError::BadFileFormat)
        ));
    }
}
