use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use futures::future::try_join_all;
use tracing::info;

use querycache::cache::TracingMiddleware;
use querycache::config::Config;
use querycache::omdb::CachedOmdbClient;
use querycache::telemetry;

#[derive(Parser, Debug)]
#[command(name = "querycache")]
#[command(about = "Query the OMDb API through a deduplicating cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/querycache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Log every cache transition
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Search movie titles. Several terms are fetched concurrently.
  Search {
    #[arg(required = true)]
    terms: Vec<String>,
  },
  /// Show the image configuration
  Configuration,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _guard = telemetry::init(&config.logging, args.verbose)?;

  let omdb = CachedOmdbClient::new(&config)?;
  if args.verbose {
    omdb.add_middleware(Arc::new(TracingMiddleware));
  }

  match args.command {
    Command::Search { terms } => {
      let pages = try_join_all(terms.iter().map(|term| omdb.search_movies(term))).await?;
      for (term, page) in terms.iter().zip(pages) {
        println!("{} ({} results)", term, page.total);
        for movie in page.movies {
          println!("  {}  {} ({}) [{}]", movie.imdb_id, movie.title, movie.year, movie.kind);
        }
      }
    }
    Command::Configuration => {
      let configuration = omdb.configuration().await?;
      println!("base url:        {}", configuration.images.secure_base_url);
      println!("poster sizes:    {}", configuration.images.poster_sizes.join(", "));
      println!("backdrop sizes:  {}", configuration.images.backdrop_sizes.join(", "));
      println!("change keys:     {}", configuration.change_keys.join(", "));
    }
  }

  info!(
    cached = omdb.query_client().cached_keys().len(),
    "done"
  );
  Ok(())
}
