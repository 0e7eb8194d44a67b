/*  file:       cli_args.rs
    desc:       ropforge::CLIArgs struct and the gadget-search constraints
                derived from it.
 */

use clap::Parser;

// Struct to contain the clap-parsed arguments.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct CLIArgs {
    // path to the target binary to build a chain for
    #[arg(short, long)]
    pub bin_path: String,

    // string containing regex to filter the gadget pool with
    #[arg(short, long)]
    pub regex_str: Option<String>,

    // maximum number of instructions to consider a gadget
    #[arg(short, long, default_value_t = 6)]
    pub max_insns: usize,

    // minimum number of instructions to consider a gadget
    #[arg(long, default_value_t = 1)]
    pub min_insns: usize,

    // path to write the raw chain payload to
    #[arg(short, long)]
    pub out: Option<String>,
}

// Constraints applied during the gadget search.
#[derive(Clone, Copy, Debug)]
pub struct GadgetConstraints {
    pub min_insns: usize,
    pub max_insns: usize,
}

// GadgetConstraints method impls
impl GadgetConstraints {
    // from_cli_args() derives sane search constraints from the parsed
    // arguments.
    pub fn from_cli_args(args: &CLIArgs) -> Self {
        let min_insns = args.min_insns.max(1);
        GadgetConstraints {
            min_insns,
            max_insns: args.max_insns.max(min_insns),
        }
    }
}
