//! Tessera command-line client

mod fsck;
mod render;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::{Path, PathBuf};
use tessera_core::{
    parse_unified, ApplyMode, ConfigValue, Error, ObjectId, ObjectKind, Order, RepoConfig, Repository,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tessera")]
#[command(author = "Tessera Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Content-addressed version control with smart merging", long_about = None)]
struct Cli {
    /// Run as if started in this directory
    #[arg(short = 'C', long, global = true, default_value = ".")]
    dir: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an empty repository
    Init {
        /// Branch HEAD starts on
        #[arg(short, long)]
        branch: Option<String>,
    },

    /// Stage files or directories for the next commit
    Add {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Stage the removal of files
    Rm {
        /// Keep the work-tree file
        #[arg(long)]
        cached: bool,
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Show staged, unstaged and untracked changes
    Status {
        /// Machine-readable output
        #[arg(long)]
        json: bool,
    },

    /// Record the staged changes
    Commit {
        #[arg(short, long)]
        message: String,
        /// Defaults to the configured user
        #[arg(long)]
        author: Option<String>,
    },

    /// List, create or delete branches
    Branch {
        name: Option<String>,
        /// Revision the new branch starts at
        #[arg(long)]
        start: Option<String>,
        #[arg(short, long)]
        delete: bool,
    },

    /// Switch to a branch or detach HEAD at a revision
    Checkout { rev: String },

    /// Merge a revision into HEAD
    Merge {
        rev: Option<String>,
        /// Abandon the merge in progress
        #[arg(long, conflicts_with = "rev")]
        abort: bool,
    },

    /// Mark conflicted files as resolved
    Resolve {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Show commit history
    Log {
        #[arg(short = 'n', long, default_value_t = 20)]
        max_count: usize,
        /// Children before parents instead of newest first
        #[arg(long)]
        topo: bool,
        /// Draw the commit graph
        #[arg(long)]
        graph: bool,
    },

    /// Show changes as unified diffs
    Diff {
        from: Option<String>,
        to: Option<String>,
        /// Lines of context
        #[arg(short = 'U', long)]
        unified: Option<usize>,
        /// Compare HEAD with the index
        #[arg(long, conflicts_with_all = ["from", "to"])]
        staged: bool,
        /// Only print per-file line counts
        #[arg(long)]
        stat: bool,
    },

    /// Apply a patch produced by `diff` to the work tree
    Apply {
        /// Patch file, `-` for stdin
        patch: PathBuf,
        /// Only report whether the patch applies
        #[arg(long)]
        check: bool,
        /// Require every hunk at its recorded position
        #[arg(long)]
        strict: bool,
    },

    /// List or create tags
    Tag {
        name: Option<String>,
        #[arg(long)]
        target: Option<String>,
        /// Annotate the tag
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Commit graph statistics
    Stats,

    /// Print a stored object
    CatObject {
        rev: String,
        /// Print only the kind
        #[arg(short = 't', long)]
        kind: bool,
    },

    /// Hash a file as a blob, optionally storing it
    HashObject {
        path: PathBuf,
        #[arg(short, long)]
        write: bool,
    },

    /// Read or set configuration
    Config {
        key: Option<String>,
        value: Option<String>,
    },

    /// Move a ref, optionally only if it has the expected value
    UpdateRef {
        name: String,
        new: String,
        #[arg(long)]
        expected: Option<String>,
    },

    /// Verify every stored object
    Fsck,
}

fn main() {
    let cli = Cli::parse();

    let env_filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            exit_code(&e)
        }
    };
    std::process::exit(code);
}

/// Core errors keep their own codes; anything else counts as I/O
fn exit_code(e: &anyhow::Error) -> i32 {
    e.downcast_ref::<Error>().map(Error::exit_code).unwrap_or(-4)
}

fn run(mut cli: Cli) -> Result<i32> {
    cli.dir = cli
        .dir
        .canonicalize()
        .with_context(|| format!("cannot access {}", cli.dir.display()))?;
    let mut repo = match &cli.command {
        Commands::Init { branch } => return init(&cli.dir, branch.as_deref()),
        _ => Repository::discover(&cli.dir)?,
    };

    match cli.command {
        Commands::Init { .. } => {}

        Commands::Add { paths } => {
            let mut staged = 0;
            for path in &paths {
                staged += repo.index_add(&cli.dir.join(path))?;
            }
            tracing::info!("Staged {} path(s)", staged);
        }

        Commands::Rm { cached, paths } => {
            for path in &paths {
                repo.index_remove(&cli.dir.join(path), cached)?;
                println!("rm '{}'", path.display());
            }
        }

        Commands::Status { json } => {
            let status = repo.status()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&render::status_json(&status))?);
            } else {
                print!("{}", render::status(&status));
            }
        }

        Commands::Commit { message, author } => {
            let author = author
                .or_else(|| repo.config().author())
                .ok_or_else(|| anyhow!("no author: pass --author or set user_name"))?;
            let id = repo.commit_create(&message, &author)?;
            let head = repo.head()?;
            let branch = head.branch().unwrap_or("detached HEAD");
            println!("[{} {}] {}", branch, id.short(), message.lines().next().unwrap_or(""));
        }

        Commands::Branch { name, start, delete } => match (name, delete) {
            (Some(name), true) => {
                repo.branch_delete(&name)?;
                println!("Deleted branch {}", name);
            }
            (Some(name), false) => {
                let target = repo.branch_create(&name, start.as_deref())?;
                println!("Created branch {} at {}", name, target.short());
            }
            (None, true) => return Err(anyhow!("branch name required for --delete")),
            (None, false) => {
                for branch in repo.branch_list()? {
                    let mark = if branch.current { '*' } else { ' ' };
                    println!("{} {} {}", mark, branch.name, branch.target.short());
                }
            }
        },

        Commands::Checkout { rev } => {
            let head = repo.checkout(&rev)?;
            match head.branch() {
                Some(branch) => println!("Switched to branch '{}'", branch),
                None => println!("HEAD is now detached at {}", rev),
            }
        }

        Commands::Merge { rev, abort } => {
            if abort {
                repo.merge_abort()?;
                println!("Merge aborted");
                return Ok(0);
            }
            let rev = rev.ok_or_else(|| anyhow!("revision to merge is required"))?;
            let outcome = repo.merge(&rev).with_context(|| format!("merging {}", rev))?;
            print!("{}", render::merge_outcome(&outcome));
            return Ok(outcome.exit_code());
        }

        Commands::Resolve { paths } => {
            for path in &paths {
                repo.resolve(&cli.dir.join(path))?;
                println!("Resolved '{}'", path.display());
            }
        }

        Commands::Log { max_count, topo, graph } => {
            if graph {
                print!("{}", repo.log_graph(max_count)?);
            } else {
                let order = if topo { Order::Topological } else { Order::Chronological };
                let labels = tessera_core::repo::branch_labels(&repo.branch_list()?);
                for node in repo.log(max_count, order)? {
                    print!("{}", render::log_entry(&node, labels.get(&node.id)));
                }
            }
        }

        Commands::Diff { from, to, unified, staged, stat } => {
            let mut options = repo.diff_options();
            if let Some(context) = unified {
                options.context = context;
            }
            let patches = if staged {
                repo.diff_staged(options)?
            } else {
                repo.diff(from.as_deref(), to.as_deref(), options)?
            };
            if stat {
                print!("{}", render::diff_stat(&patches));
            } else {
                for patch in &patches {
                    print!("{}", patch.to_unified());
                }
            }
        }

        Commands::Apply { patch, check, strict } => {
            let text = if patch.as_os_str() == "-" {
                let mut text = String::new();
                std::io::stdin().read_to_string(&mut text).context("reading patch from stdin")?;
                text
            } else {
                std::fs::read_to_string(cli.dir.join(&patch))
                    .with_context(|| format!("reading {}", patch.display()))?
            };
            let patches = parse_unified(&text)?;
            let mode = if strict { ApplyMode::Strict } else { repo.apply_mode() };
            if !repo.apply(&patches, mode, check)? {
                eprintln!("error: patch does not apply");
                return Ok(1);
            }
            if check {
                println!("{} patch(es) apply cleanly", patches.len());
            }
        }

        Commands::Tag { name, target, message } => match name {
            Some(name) => {
                let tagger = repo.config().author().unwrap_or_else(|| "tessera".to_string());
                let id = repo.tag_create(&name, target.as_deref(), message.as_deref(), &tagger)?;
                println!("Created tag {} ({})", name, id.short());
            }
            None => {
                for tag in repo.tag_list()? {
                    match tag.annotation {
                        Some(annotation) => println!("{}\t{}\t{}", tag.name, tag.commit.short(), annotation.message),
                        None => println!("{}\t{}", tag.name, tag.commit.short()),
                    }
                }
            }
        },

        Commands::Stats => {
            let stats = repo.statistics()?;
            println!("commits:  {}", stats.total_commits);
            println!("roots:    {}", stats.root_commits);
            println!("regular:  {}", stats.regular_commits);
            println!("merges:   {}", stats.merge_commits);
            println!("tips:     {}", stats.tips);
        }

        Commands::CatObject { rev, kind } => {
            let id = repo.resolve_rev(&rev)?;
            let raw = repo.read_object(&id)?;
            if kind {
                println!("{}", raw.kind);
            } else {
                print!("{}", render::object(&raw)?);
            }
        }

        Commands::HashObject { path, write } => {
            let data = std::fs::read(cli.dir.join(&path))
                .with_context(|| format!("reading {}", path.display()))?;
            let id = if write {
                repo.write_object(ObjectKind::Blob, &data)?
            } else {
                tessera_core::object::hash_object(ObjectKind::Blob, &data)
            };
            println!("{}", id);
        }

        Commands::Config { key, value } => match (key, value) {
            (Some(key), Some(raw)) => {
                let value = repo.config().parse_value(&key, &raw)?;
                repo.set_config(&key, value)?;
            }
            (Some(key), None) => println!("{}", repo.config().get(&key)?),
            (None, _) => {
                for key in tessera_core::config::CONFIG_KEYS {
                    println!("{} = {}", key, repo.config().get(key)?);
                }
            }
        },

        Commands::UpdateRef { name, new, expected } => {
            let new = repo.resolve_commit(&new)?;
            let expected = expected.map(|e| ObjectId::from_hex(&e)).transpose()?;
            repo.update_ref(&name, &new, expected.as_ref())?;
        }

        Commands::Fsck => return fsck::run(&repo),
    }

    Ok(0)
}

fn init(dir: &Path, branch: Option<&str>) -> Result<i32> {
    let mut config = RepoConfig::default();
    if let Some(branch) = branch {
        config.set("default_branch", ConfigValue::Str(branch.to_string()))?;
    }
    let repo = Repository::init_with_config(dir, config)?;
    println!("Initialized empty repository in {}", repo.store_dir().display());
    Ok(0)
}
