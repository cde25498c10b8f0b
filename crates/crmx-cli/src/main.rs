use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use crmx_core::{Category, Contact, Opportunity, Snapshot, Task};
use crmx_sync::{CrmxConfig, Envelope, PageTarget};

#[derive(Debug, Parser)]
#[command(name = "crmx-cli")]
#[command(about = "Capture Close list-view records into a local snapshot")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one extraction and merge it into the snapshot.
    Extract(PageArgs),
    /// Print stored records.
    List {
        #[arg(long)]
        category: Option<Category>,
        /// Substring filter over contact name, lead and emails.
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        json: bool,
    },
    Delete { category: Category, id: String },
    Clear { category: Category },
    /// Serve the panel; Extract Now reads from the given page.
    Serve(PageArgs),
}

#[derive(Debug, Args)]
struct PageArgs {
    /// Saved HTML of the list view.
    #[arg(long, conflicts_with = "fetch")]
    html: Option<PathBuf>,
    /// Fetch the page over HTTP instead; the final URL drives the view check.
    #[arg(long)]
    fetch: Option<String>,
    /// Address the saved page was captured from; used for the view check.
    #[arg(long, requires = "html")]
    url: Option<String>,
}

impl PageArgs {
    fn into_target(self) -> Result<PageTarget> {
        match (self.html, self.fetch) {
            (Some(path), None) => Ok(PageTarget::File {
                url: self.url.context("--url is required with --html")?,
                path,
            }),
            (None, Some(fetch)) => Ok(PageTarget::Remote { url: fetch }),
            _ => bail!("pass exactly one of --html <file> or --fetch <url>"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let cli = Cli::parse();
    let config = CrmxConfig::from_env();

    match cli.command {
        Commands::Extract(page) => {
            match crmx_sync::run_extraction_once(&config, page.into_target()?).await? {
                Envelope::Success { data } => println!(
                    "extract complete: run_id={} contacts={} opportunities={} tasks={} revision={}",
                    data.run_id, data.stored.contacts, data.stored.opportunities, data.stored.tasks, data.revision
                ),
                Envelope::Error { message } => bail!(message),
            }
        }
        Commands::List { category, search, json } => {
            let snapshot = config.open_store().read().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print_snapshot(&snapshot, category, search.as_deref().unwrap_or(""));
            }
        }
        Commands::Delete { category, id } => {
            let outcome = config.open_store().delete_record(category, &id).await?;
            if outcome.removed == 0 {
                eprintln!("no {category} with id {id}");
            } else {
                println!("deleted {category} {id}");
            }
        }
        Commands::Clear { category } => {
            let cleared = config.open_store().clear_category(category).await?;
            println!("cleared {cleared} {}", category.list_name());
        }
        Commands::Serve(page) => {
            crmx_web::serve_from_env(page.into_target()?).await?;
        }
    }

    Ok(())
}

fn print_snapshot(snapshot: &Snapshot, only: Option<Category>, search: &str) {
    let last_sync = snapshot
        .last_sync
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "never".to_string());
    println!("last sync: {last_sync} (revision {})", snapshot.revision);

    for category in Category::ALL {
        if only.is_some_and(|c| c != category) {
            continue;
        }
        println!("\n[{}]", category.list_name());
        match category {
            Category::Contact => {
                for c in snapshot.typed::<Contact>().iter().filter(|c| c.matches_query(search)) {
                    println!("{}\t{}\t{}\t{}", c.id, c.name, c.lead, c.emails.join(","));
                }
            }
            Category::Opportunity => {
                for o in snapshot.typed::<Opportunity>() {
                    println!("{}\t{}\t{}\t{}\t{}", o.id, o.name, o.value, o.status, o.close_date);
                }
            }
            Category::Task => {
                for t in snapshot.typed::<Task>() {
                    let mark = if t.done { "x" } else { " " };
                    println!("{}\t[{mark}] {}\t{}\t{}", t.id, t.description, t.due_date, t.assignee);
                }
            }
        }
    }
}
