mod render;

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use colored::Colorize;
use dialog_core::{ContextMaterializer, DialogTree, SessionConfig};
use dialog_graph::{GraphLayoutEngine, GraphNavigator, LayoutOptions};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "dialog-cli")]
#[command(about = "Inspect and steer saved conversation trees")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the tree with forks, alternatives and the active path
    Show {
        /// Snapshot file
        file: PathBuf,
    },
    /// Print the history a model call would receive
    Context {
        file: PathBuf,
        /// Node to materialize instead of the active leaf (id or unique prefix)
        #[arg(long)]
        leaf: Option<String>,
    },
    /// Print computed node positions
    Layout {
        file: PathBuf,
        /// Emit an SVG document
        #[arg(long, conflicts_with = "json")]
        svg: bool,
        /// Emit the layout as JSON
        #[arg(long)]
        json: bool,
        #[arg(long)]
        include_root: bool,
    },
    /// Make a node the active leaf and save the file
    Select {
        file: PathBuf,
        /// Node id or unique prefix
        id: String,
        /// Continue down first children to a leaf
        #[arg(long)]
        to_leaf: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Show { file } => {
            let tree = load(&file).await?;
            print!("{}", render::tree_outline(&tree));
        }
        Commands::Context { file, leaf } => {
            let tree = load(&file).await?;
            let leaf = match leaf {
                Some(prefix) => resolve_id(&tree, &prefix)?,
                None => tree.active_leaf(),
            };
            let context = ContextMaterializer::from_config(&SessionConfig::load())
                .materialize(&tree, leaf)?;
            print!("{}", render::context_listing(&context));
        }
        Commands::Layout {
            file,
            svg,
            json,
            include_root,
        } => {
            let tree = load(&file).await?;
            let engine = GraphLayoutEngine::new(LayoutOptions {
                include_root,
                ..Default::default()
            });
            let layout = engine.layout(&tree)?;
            if svg {
                print!("{}", render::layout_svg(&layout));
            } else if json {
                println!("{}", serde_json::to_string_pretty(&layout)?);
            } else {
                print!("{}", render::layout_table(&layout));
            }
        }
        Commands::Select { file, id, to_leaf } => {
            let mut tree = load(&file).await?;
            let id = resolve_id(&tree, &id)?;
            let mut navigator = GraphNavigator::from_tree(&tree);
            navigator.select(&tree, id)?;
            let committed = if to_leaf {
                navigator.commit_to_leaf(&mut tree)?
            } else {
                navigator.commit(&mut tree)?
            };
            save(&file, &tree).await?;
            println!(
                "{} {}",
                "Active leaf:".green().bold(),
                render::short_id(committed)
            );
        }
    }

    Ok(())
}

async fn load(path: &Path) -> anyhow::Result<DialogTree> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let tree = DialogTree::from_json(&contents)
        .with_context(|| format!("{} is not a valid conversation snapshot", path.display()))?;
    tracing::debug!(path = %path.display(), nodes = tree.len(), "loaded tree");
    Ok(tree)
}

async fn save(path: &Path, tree: &DialogTree) -> anyhow::Result<()> {
    tokio::fs::write(path, tree.to_json()?)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Accepts a full id or an unambiguous prefix of its simple (hyphenless) form.
fn resolve_id(tree: &DialogTree, text: &str) -> anyhow::Result<Uuid> {
    if let Ok(id) = Uuid::parse_str(text) {
        return Ok(id);
    }
    let prefix = text.replace('-', "").to_lowercase();
    if prefix.is_empty() {
        bail!("empty node id");
    }
    let mut matches = tree
        .iter_depth_first()
        .map(|node| node.id())
        .filter(|id| id.simple().to_string().starts_with(&prefix));
    let first = matches
        .next()
        .ok_or_else(|| anyhow!("no node matches '{text}'"))?;
    if matches.next().is_some() {
        bail!("'{text}' matches more than one node");
    }
    Ok(first)
}
