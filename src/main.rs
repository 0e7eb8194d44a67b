/*  file:       main.rs
    desc:       Entrypoint for ropforge: parse the target binary, mine and
                classify its gadget pool, report the classification stats,
                and build a verified execve chain.
 */

use clap::Parser;
use log::info;
use object::Object;
use regex::Regex;
use ropforge::arch::Arch;
use ropforge::cli_args::{CLIArgs, GadgetConstraints};
use ropforge::combiner::GadgetsCombiner;
use ropforge::discover::discover_gadgets;
use ropforge::error::{Error, Result};

// main() is the entrypoint.
fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // parse cli args and gadget constraints
    let cli_args = CLIArgs::parse();
    let constraints = GadgetConstraints::from_cli_args(&cli_args);
    let filter = cli_args
        .regex_str
        .as_deref()
        .map(|s| Regex::new(s).expect("Failed to compile regex!"));

    // read the binary file into memory, then parse it
    let bin_data = std::fs::read(&cli_args.bin_path)?;
    let bin_file = object::File::parse(&*bin_data)?;
    let arch = Arch::from_obj_arch(bin_file.architecture()).ok_or(Error::UnsupportedArch)?;
    info!("target is {arch}");

    // mine and classify the gadget pool
    let pool = discover_gadgets(&bin_file, arch, constraints, filter.as_ref())?;

    // report the classification frequencies, then combine
    let mut combiner = GadgetsCombiner::new(arch, pool);
    print!("{}", combiner.stats());
    let chain = combiner.execve(&bin_file)?;
    print!("{}", chain.dump());

    if let Some(path) = &cli_args.out {
        std::fs::write(path, chain.payload())?;
        info!("payload written to {path}");
    }
    Ok(())
}
