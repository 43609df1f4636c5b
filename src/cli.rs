use clap::{Parser, Subcommand};

use product_backfill::{BackfillOptions, SelectionPolicy};

#[derive(Parser)]
#[command(name = "product-backfill")]
#[command(about = "Backfill seller company ids onto products")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Sample products and report eligibility without writing
    Scan {
        /// Number of products to sample
        #[arg(long)]
        sample_limit: Option<usize>,
    },
    /// Run a backfill until the selected sellers are exhausted
    Run {
        /// Products per atomic batch write
        #[arg(long)]
        batch_size: Option<usize>,
        /// Selection policy: random, priority-first, sorted-by-partition
        #[arg(long)]
        policy: Option<SelectionPolicy>,
        /// Number of sellers to exhaust in this run
        #[arg(long)]
        owner_limit: Option<usize>,
        /// Seed for the random selection policy
        #[arg(long)]
        seed: Option<u64>,
        /// Do not create the supporting indexes first
        #[arg(long)]
        skip_indexes: bool,
    },
    /// Create the indexes backing pagination and the eligibility filter
    Indexes,
}

impl Command {
    /// Overlay command-line flags onto options loaded from the environment.
    pub fn apply(&self, options: &mut BackfillOptions) {
        match self {
            Command::Scan { sample_limit } => {
                if let Some(limit) = sample_limit {
                    options.sample_limit = *limit;
                }
            }
            Command::Run { batch_size, policy, owner_limit, seed, .. } => {
                if let Some(size) = batch_size {
                    options.batch_size = *size;
                }
                if let Some(policy) = policy {
                    options.policy = *policy;
                }
                if let Some(limit) = owner_limit {
                    options.owner_limit = *limit;
                }
                if seed.is_some() {
                    options.seed = *seed;
                }
            }
            Command::Indexes => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_flags_override_options() {
        let cli = Cli::parse_from([
            "product-backfill",
            "run",
            "--batch-size",
            "50",
            "--policy",
            "sorted-by-partition",
            "--owner-limit",
            "3",
        ]);
        let mut options = BackfillOptions::default();
        cli.command.unwrap().apply(&mut options);
        assert_eq!(options.batch_size, 50);
        assert_eq!(options.policy, SelectionPolicy::SortedByPartition);
        assert_eq!(options.owner_limit, 3);
        assert_eq!(options.seed, None);
    }

    #[test]
    fn test_no_subcommand_parses() {
        let cli = Cli::parse_from(["product-backfill"]);
        assert!(cli.command.is_none());
    }
}
