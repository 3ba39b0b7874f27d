//! Coordinate liftover between genome builds.

use std::io::BufRead;
use std::sync::OnceLock;

use chainfile as chain;
use omics::coordinate::interval::interbase::Interval;

use crate::common::open_read_maybe_gz;

/// Conversion of single positions to another genome build.
pub trait Liftover: Send + Sync {
    /// Convert a 1-based position; `None` if the position cannot be mapped.
    fn convert(&self, chrom: &str, pos: u64) -> Option<(String, u64)>;
}

/// Strip a `chr` prefix from a chromosome name.
fn strip_chr(chrom: &str) -> &str {
    chrom.strip_prefix("chr").unwrap_or(chrom)
}

/// Contig and forward strand 1-based position of a single base interval in
/// `contig:strand:start-end` notation.
///
/// Interbase bounds run backwards on the negative strand, so the base is
/// always the one ending at the larger bound.
fn single_base_position(interval: &str) -> Option<(String, u64)> {
    let mut fields = interval.rsplitn(3, ':');
    let (start, end) = fields.next()?.split_once('-')?;
    let _strand = fields.next()?;
    let contig = fields.next()?;
    let start = start.parse::<u64>().ok()?;
    let end = end.parse::<u64>().ok()?;
    Some((strip_chr(contig).to_owned(), start.max(end)))
}

/// Liftover along the alignment sections of a UCSC chain file.
///
/// Gaps between the blocks of a section are unmapped; sections aligned to
/// the reverse strand of the target yield forward strand positions.
#[derive(Debug)]
pub struct ChainLiftover {
    machine: chain::liftover::Machine,
}

impl ChainLiftover {
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, anyhow::Error> {
        let machine = chain::liftover::machine::Builder::default()
            .try_build_from(chain::Reader::new(reader))
            .map_err(|e| anyhow::anyhow!("could not read chain file: {}", e))?;
        Ok(Self { machine })
    }

    /// Load a chain file, gzip compressed if the name ends in `.gz`.
    pub fn from_path(path: &str) -> Result<Self, anyhow::Error> {
        let reader = open_read_maybe_gz(path)
            .map_err(|e| anyhow::anyhow!("could not open chain file {}: {}", path, e))?;
        let result = Self::from_reader(reader)
            .map_err(|e| anyhow::anyhow!("could not load chain file {}: {}", path, e))?;
        tracing::debug!("loaded liftover chains from {}", path);
        Ok(result)
    }
}

impl Liftover for ChainLiftover {
    fn convert(&self, chrom: &str, pos: u64) -> Option<(String, u64)> {
        let interval = format!("chr{}:+:{}-{}", strip_chr(chrom), pos.checked_sub(1)?, pos)
            .parse::<Interval>()
            .ok()?;
        let pair = self.machine.liftover(interval)?.into_iter().next()?;
        single_base_position(&pair.query().to_string())
    }
}

type LiftoverFactory = Box<dyn Fn() -> Result<Box<dyn Liftover>, anyhow::Error> + Send + Sync>;

/// Liftover constructed on first use.
///
/// Construction is attempted once; a failure is logged and remembered, and
/// the liftover is unavailable from then on.
pub struct LazyLiftover {
    factory: LiftoverFactory,
    liftover: OnceLock<Option<Box<dyn Liftover>>>,
}

impl std::fmt::Debug for LazyLiftover {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyLiftover")
            .field("initialized", &self.liftover.get().is_some())
            .finish()
    }
}

impl LazyLiftover {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn Liftover>, anyhow::Error> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            liftover: OnceLock::new(),
        }
    }

    /// Liftover loading the chain file at `path`.
    pub fn from_path(path: String) -> Self {
        Self::new(move || Ok(Box::new(ChainLiftover::from_path(&path)?) as Box<dyn Liftover>))
    }

    /// Liftover that is never available.
    pub fn unavailable() -> Self {
        Self::new(|| Err(anyhow::anyhow!("no liftover configured")))
    }

    /// The liftover, if it could be constructed.
    pub fn get(&self) -> Option<&dyn Liftover> {
        self.liftover
            .get_or_init(|| match (self.factory)() {
                Ok(liftover) => Some(liftover),
                Err(e) => {
                    tracing::warn!("Unable to set up liftover: {}", e);
                    None
                }
            })
            .as_deref()
    }
}
