//! Common functionality.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use byte_unit::{Byte, UnitType};
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use flate2::bufread::MultiGzDecoder;
use indexmap::IndexMap;

/// Commonly used command line arguments.
#[derive(Parser, Debug)]
pub struct Args {
    /// Verbosity of the program
    #[clap(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            verbose: Verbosity::new(0, 0),
        }
    }
}

/// Helper to print the current memory resident set size via `tracing`.
pub fn trace_rss_now() {
    let rss = procfs::process::Process::myself()
        .and_then(|me| me.stat())
        .map(|stat| stat.rss * procfs::page_size());
    match rss {
        Ok(rss) => tracing::debug!(
            "RSS now: {:.2}",
            Byte::from_u64(rss).get_appropriate_unit(UnitType::Binary)
        ),
        Err(e) => tracing::debug!("could not determine RSS: {}", e),
    }
}

/// Transparently open a file with gzip decoder.
pub fn open_read_maybe_gz<P>(path: P) -> Result<Box<dyn BufRead>, anyhow::Error>
where
    P: AsRef<Path>,
{
    if path.as_ref().extension().map(|s| s.to_str()) == Some(Some("gz")) {
        tracing::trace!("Opening {:?} as gzip for reading", path.as_ref());
        let file = File::open(path)?;
        let decoder = MultiGzDecoder::new(BufReader::new(file));
        Ok(Box::new(BufReader::new(decoder)))
    } else {
        tracing::trace!("Opening {:?} as plain text for reading", path.as_ref());
        Ok(Box::new(BufReader::new(File::open(path)?)))
    }
}

/// Definition of canonical chromosome names.
pub const CHROMS: &[&str] = &[
    "1", "2", "3", "4", "5", "6", "7", "8", "9", "10", "11", "12", "13", "14", "15", "16", "17",
    "18", "19", "20", "21", "22", "X", "Y", "M",
];

/// Factor separating the chromosome number from the position in an `xpos` value.
const XPOS_FACTOR: u64 = 1_000_000_000;

/// Build mapping of chromosome names to 1-based chromosome numbers as used in `xpos`.
pub fn build_chrom_map() -> IndexMap<String, u64> {
    let mut result = IndexMap::new();
    for (i, &chrom_name) in CHROMS.iter().enumerate() {
        let number = i as u64 + 1;
        result.insert(chrom_name.to_owned(), number);
        result.insert(format!("chr{chrom_name}"), number);
        result.insert(chrom_name.to_ascii_lowercase(), number);
    }
    result.insert("MT".to_owned(), 25);
    result.insert("chrMT".to_owned(), 25);
    result.insert("mt".to_owned(), 25);
    result
}

/// Error type for the `xpos` helpers.
pub(crate) mod xpos {
    #[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
    pub enum Error {
        #[error("Invalid chromosome: {0:?}")]
        InvalidChrom(String),
        #[error("Invalid position: {0}")]
        InvalidPos(u64),
        #[error("Invalid xpos: {0}")]
        InvalidXpos(u64),
    }
}

/// Encode chromosome and 1-based position into a single sortable number.
pub fn get_xpos(chrom: &str, pos: u64) -> Result<u64, xpos::Error> {
    let number = build_chrom_map()
        .get(chrom)
        .copied()
        .ok_or_else(|| xpos::Error::InvalidChrom(chrom.to_owned()))?;
    if pos == 0 || pos >= XPOS_FACTOR {
        return Err(xpos::Error::InvalidPos(pos));
    }
    Ok(number * XPOS_FACTOR + pos)
}

/// Decode an `xpos` value into the canonical chromosome name and position.
pub fn get_chrom_pos(xpos: u64) -> Result<(String, u64), xpos::Error> {
    let number = xpos / XPOS_FACTOR;
    if number == 0 || number as usize > CHROMS.len() {
        return Err(xpos::Error::InvalidXpos(xpos));
    }
    Ok((CHROMS[number as usize - 1].to_owned(), xpos % XPOS_FACTOR))
}

/// Select the genome release to use.
#[derive(
    clap::ValueEnum,
    Clone,
    Copy,
    Debug,
    Default,
    strum::Display,
    PartialEq,
    Eq,
    enum_map::Enum,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub enum GenomeRelease {
    // GRCh37 / hg19
    #[default]
    #[strum(serialize = "grch37")]
    #[serde(rename = "37", alias = "GRCh37")]
    Grch37,
    /// GRCh38 / hg38
    #[strum(serialize = "grch38")]
    #[serde(rename = "38", alias = "GRCh38")]
    Grch38,
}

impl GenomeRelease {
    pub fn name(&self) -> String {
        match self {
            GenomeRelease::Grch37 => String::from("GRCh37"),
            GenomeRelease::Grch38 => String::from("GRCh38"),
        }
    }
}

impl std::str::FromStr for GenomeRelease {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.to_ascii_lowercase();
        if s.starts_with("grch37") || s == "37" {
            Ok(GenomeRelease::Grch37)
        } else if s.starts_with("grch38") || s == "38" {
            Ok(GenomeRelease::Grch38)
        } else {
            Err(anyhow::anyhow!("Unknown genome release: {}", s))
        }
    }
}
