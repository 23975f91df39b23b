//! CLI command definitions and handlers.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use kiln_common::{InstanceName, KilnError};

use crate::instance::Instance;
use crate::runner::{NspawnClassifier, NspawnRuntime};
use crate::workspace::{ContainerSet, Workspace};

/// Kiln - disposable OS build containers
#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Workspace directory
    #[arg(
        short = 'C',
        long = "workspace",
        global = true,
        env = "KILN_WORKSPACE",
        default_value = "."
    )]
    pub workspace: PathBuf,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Workspace and instance commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new workspace in the target directory
    Init,

    /// Unpack an OS tarball into the empty distribution layer
    LoadOs {
        /// Path to a tar, tar.gz or tar.zst archive
        tarball: PathBuf,
    },

    /// Replace the distribution layer with a fresh OS tarball
    UpdateOs {
        /// Path to a tar, tar.gz or tar.zst archive
        tarball: PathBuf,
    },

    /// Create an instance
    Add {
        /// Instance name
        instance: InstanceName,
    },

    /// Stop, unmount and delete an instance
    Del {
        /// Instance name
        instance: InstanceName,
    },

    /// Mount an instance's union filesystem
    Mount {
        /// Instance name
        instance: InstanceName,
    },

    /// Unmount an instance's union filesystem
    Unmount {
        /// Instance name
        instance: InstanceName,
    },

    /// Run a command inside an instance
    Run {
        /// Boot the container's service manager when possible
        #[arg(short, long)]
        boot: bool,

        /// Attach the session to the shared network zone
        #[arg(short, long)]
        network: bool,

        /// Instance name
        instance: InstanceName,

        /// Command and arguments
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Open a login shell inside an instance
    Shell {
        /// Boot the container's service manager when possible
        #[arg(short, long)]
        boot: bool,

        /// User to look up in the container's passwd database
        #[arg(short, long, default_value = "root")]
        user: String,

        /// Instance name
        instance: InstanceName,

        /// Command to run through the shell instead of an interactive one
        #[arg(trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// Stop a running instance
    Stop {
        /// Instance name
        instance: InstanceName,
    },

    /// Fold an instance's changes down into the distribution layer
    Commit {
        /// Instance name
        instance: InstanceName,
    },

    /// Discard everything an instance has written on top of the base
    Rollback {
        /// Instance name
        instance: InstanceName,
    },

    /// List instances and their states
    List {
        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },
}

impl Cli {
    /// Execute the CLI command, returning the process exit code.
    pub async fn execute(self) -> Result<i32> {
        if let Commands::Init = self.command {
            Workspace::init(&self.workspace)?;
            println!("Workspace initialized in {}", self.workspace.display());
            return Ok(0);
        }

        let workspace = Workspace::open(&self.workspace)?;
        let containers = workspace.containers(
            Arc::new(NspawnRuntime::default()),
            Arc::new(NspawnClassifier),
        );

        match self.command {
            Commands::Init => unreachable!("handled above"),

            Commands::LoadOs { tarball } => {
                containers.load_os(&tarball)?;
                println!("OS tree loaded");
            }

            Commands::UpdateOs { tarball } => {
                containers.update_os(&tarball).await?;
                println!("OS tree updated");
            }

            Commands::Add { instance } => {
                containers.add(&instance)?;
                println!("Instance {instance} created");
            }

            Commands::Del { instance } => {
                containers.del(&instance).await?;
                println!("Instance {instance} deleted");
            }

            Commands::Mount { instance } => {
                containers.instance(&instance)?.mount()?;
            }

            Commands::Unmount { instance } => {
                match containers.instance(&instance)?.unmount().await {
                    Ok(()) => {}
                    Err(KilnError::NotMounted { name }) => {
                        tracing::warn!(instance = %name, "instance was not mounted");
                    }
                    Err(err) => return Err(err.into()),
                }
            }

            Commands::Run {
                boot,
                network,
                instance,
                command,
            } => {
                let instance = containers.instance(&instance)?;
                ensure_mounted(&instance)?;
                let code = instance
                    .run(crate::instance::RunOptions {
                        boot,
                        network,
                        runtime_args: Vec::new(),
                        command,
                    })
                    .await?;
                return Ok(code);
            }

            Commands::Shell {
                boot,
                user,
                instance,
                command,
            } => {
                let instance = containers.instance(&instance)?;
                ensure_mounted(&instance)?;
                let shell = instance.shell_for(&user)?;
                let command = if command.is_empty() {
                    vec![shell]
                } else {
                    vec![shell, "--login".to_owned(), "-c".to_owned(), command.join(" ")]
                };
                let code = instance
                    .run(crate::instance::RunOptions {
                        boot,
                        network: false,
                        runtime_args: Vec::new(),
                        command,
                    })
                    .await?;
                return Ok(code);
            }

            Commands::Stop { instance } => {
                containers.instance(&instance)?.stop().await?;
            }

            Commands::Commit { instance } => {
                let instance = containers.instance(&instance)?;
                ensure_unmounted(&instance).await?;
                instance.commit()?;
                println!("Instance {} committed", instance.name());
            }

            Commands::Rollback { instance } => {
                let instance = containers.instance(&instance)?;
                ensure_unmounted(&instance).await?;
                instance.rollback()?;
                println!("Instance {} rolled back", instance.name());
            }

            Commands::List { format } => {
                list_instances(&containers, &format).await?;
            }
        }

        Ok(0)
    }
}

/// Mount the union filesystem if it is not already there.
fn ensure_mounted(instance: &Instance) -> Result<()> {
    if !instance.mounted()? {
        instance.mount()?;
    }
    Ok(())
}

/// Unmount the union filesystem, tolerating an instance that is not mounted.
async fn ensure_unmounted(instance: &Instance) -> Result<()> {
    match instance.unmount().await {
        Ok(()) | Err(KilnError::NotMounted { .. }) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn list_instances(containers: &ContainerSet, format: &str) -> Result<()> {
    let mut statuses = Vec::new();
    for name in containers.list_names()? {
        statuses.push(containers.instance(&name)?.status().await?);
    }

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&statuses)?),
        _ => {
            println!("{:<20} {:<10} {:<10} {:<6}", "NAME", "FS", "STATE", "BOOT");
            for status in statuses {
                println!(
                    "{:<20} {:<10} {:<10} {:<6}",
                    status.name,
                    format!("{:?}", status.filesystem).to_lowercase(),
                    format!("{:?}", status.run).to_lowercase(),
                    if status.boot { "yes" } else { "no" }
                );
            }
        }
    }
    Ok(())
}
