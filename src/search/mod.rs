//! Code implementing the "search" sub command.

pub mod backend;
pub mod cache;
pub mod comphet;
pub mod conf;
pub mod executor;
pub mod interpreter;
pub mod liftover;
pub mod output;
pub mod reference;
pub mod samples;
pub mod schema;
pub mod sorting;

use std::io::Write;
use std::time::Instant;

use clap::{command, Parser};

use crate::common::trace_rss_now;

use self::conf::{BackendKind, SearchConf};
use self::executor::{SearchEngine, SearchModel};
use self::schema::query::SearchFilter;

/// Command line arguments for `search` sub command.
#[derive(Parser, Debug)]
#[command(author, version, about = "Run variant search", long_about = None)]
pub struct Args {
    /// Path to TOML configuration file.
    #[arg(long)]
    pub path_config: Option<String>,
    /// Override the backend URL from the configuration.
    #[arg(long)]
    pub backend_url: Option<String>,
    /// Override the samples TSV path from the configuration.
    #[arg(long)]
    pub path_samples: Option<String>,
    /// Use the in-memory backend with this JSON lines documents file.
    #[arg(long, requires = "path_mappings")]
    pub path_documents: Option<String>,
    /// Index mappings JSON file for the in-memory backend.
    #[arg(long)]
    pub path_mappings: Option<String>,

    /// GUIDs of the families to search.
    #[arg(long, required = true, value_delimiter = ',')]
    pub families: Vec<String>,
    /// Path to the search filter JSON file, an empty filter if missing.
    #[arg(long)]
    pub path_filter_json: Option<String>,
    /// Explicit search GUID, derived from families and filter if missing.
    #[arg(long)]
    pub search_guid: Option<String>,
    /// Sort key.
    #[arg(long, default_value = "xpos")]
    pub sort: String,
    /// 1-based page.
    #[arg(long, default_value_t = 1)]
    pub page: usize,
    /// Number of results per page.
    #[arg(long, default_value_t = 100)]
    pub num_results: usize,
    /// Return all results at once.
    #[arg(long, default_value_t = false)]
    pub load_all: bool,
    /// Load only the variant with this ID instead of a page.
    #[arg(long, conflicts_with_all = ["load_all", "search_guid"])]
    pub variant_id: Option<String>,

    /// Path to the output JSON file, stdout if missing.
    #[arg(long)]
    pub path_output: Option<String>,
}

/// Load configuration and apply command line overrides.
fn load_conf(args: &Args) -> Result<SearchConf, anyhow::Error> {
    let mut conf = match &args.path_config {
        Some(path) => SearchConf::from_path(path)?,
        None => SearchConf::default(),
    };
    if let Some(url) = &args.backend_url {
        conf.backend.url = url.clone();
    }
    if let Some(path) = &args.path_samples {
        conf.reference.samples_path = Some(path.clone());
    }
    if let Some(path) = &args.path_documents {
        conf.backend.kind = BackendKind::Memory;
        conf.backend.documents_path = Some(path.clone());
        conf.backend.mappings_path = args.path_mappings.clone();
    }
    Ok(conf)
}

fn load_filter(path: Option<&str>) -> Result<SearchFilter, anyhow::Error> {
    let Some(path) = path else {
        return Ok(SearchFilter::default());
    };
    let path = conf::expand_path(path);
    let file = std::fs::File::open(&path)
        .map_err(|e| anyhow::anyhow!("could not open filter {}: {}", &path, e))?;
    serde_json::from_reader(std::io::BufReader::new(file))
        .map_err(|e| anyhow::anyhow!("could not parse filter {}: {}", &path, e))
}

/// Main entry point for `search` sub command.
pub fn run(args_common: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    let before_anything = Instant::now();
    tracing::info!("args_common = {:?}", &args_common);
    tracing::info!("args = {:?}", &args);

    let conf = load_conf(args)?;
    tracing::debug!("conf = {:?}", &conf);

    tracing::info!("Setting up search engine...");
    let before_setup = Instant::now();
    let engine = SearchEngine::from_conf(&conf)?;
    tracing::info!("... done setting up in {:?}", before_setup.elapsed());
    trace_rss_now();

    let result = match &args.variant_id {
        Some(variant_id) => {
            let variant = engine.get_single_variant(&args.families, variant_id)?;
            serde_json::to_value(variant)?
        }
        None => {
            let search = SearchModel {
                search_guid: args.search_guid.clone(),
                family_guids: args.families.clone(),
                filter: load_filter(args.path_filter_json.as_deref())?,
            };
            tracing::info!("Running search {}...", search.search_guid());
            let before_query = Instant::now();
            let page = engine.get_variants(
                &search,
                &args.sort,
                args.page,
                args.num_results,
                args.load_all,
            )?;
            tracing::info!(
                "... done running search in {:?}, {} of {} results",
                before_query.elapsed(),
                page.variants.len(),
                page.total_results
            );
            serde_json::to_value(page)?
        }
    };

    match &args.path_output {
        Some(path) => {
            let mut writer = std::io::BufWriter::new(std::fs::File::create(path)?);
            serde_json::to_writer_pretty(&mut writer, &result)?;
            writer.flush()?;
        }
        None => {
            let stdout = std::io::stdout();
            let mut writer = stdout.lock();
            serde_json::to_writer_pretty(&mut writer, &result)?;
            writeln!(writer)?;
        }
    }

    trace_rss_now();
    tracing::info!(
        "All of `search` completed in {:?}",
        before_anything.elapsed()
    );
    Ok(())
}
