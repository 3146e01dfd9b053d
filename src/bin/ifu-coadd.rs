//! Coadd IFU cubes into a single mosaic.
//!
//! ```text
//! ifu-coadd "data/*icubes.fits" --var
//! ifu-coadd --list night1.list --ctype icubes.fits --pa 90
//! ```
use std::path::PathBuf;

use clap::Parser;
use ifucoadd::table::CubeList;
use ifucoadd::{expand_patterns, run_coadd, CoaddConfig};

#[derive(Parser, Debug)]
#[command(version, about = "Coadd IFU datacubes onto a common grid")]
struct Args {
    /// input cubes, or glob patterns matching them
    inputs: Vec<String>,

    /// cube list naming the exposures to coadd
    #[arg(short, long, conflicts_with = "inputs")]
    list: Option<PathBuf>,

    /// cube type to load from the cube list
    #[arg(long, default_value = "icubes.fits", requires = "list")]
    ctype: String,

    /// yaml file with coadd parameters; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// minimum fractional coverage of an output pixel
    #[arg(long)]
    pxthresh: Option<f64>,

    /// minimum exposure, as a fraction of the maximum, kept when trimming
    #[arg(long)]
    expthresh: Option<f64>,

    /// position angle of the output in degrees
    #[arg(long)]
    pa: Option<f64>,

    /// also coadd the matching variance cubes (icube -> vcube)
    #[arg(long)]
    var: bool,

    /// divide contributions by their flat-field coverage (does not conserve flux)
    #[arg(long)]
    flatcorr: bool,

    /// accumulate inputs in parallel
    #[arg(long)]
    parallel: bool,

    #[arg(short, long)]
    verbose: bool,
}

fn config_from_args(args: &Args) -> ifucoadd::Result<CoaddConfig> {
    let mut config = match &args.config {
        Some(path) => CoaddConfig::from_yaml(path)?,
        None => CoaddConfig::default(),
    };
    if let Some(v) = args.pxthresh {
        config.pixel_threshold = v;
    }
    if let Some(v) = args.expthresh {
        config.exposure_threshold = v;
    }
    if let Some(v) = args.pa {
        config.position_angle = v;
    }
    config.propagate_variance |= args.var;
    config.flat_correction |= args.flatcorr;
    config.parallel_inputs |= args.parallel;
    config.verbose |= args.verbose;
    config.validate()?;
    Ok(config)
}

fn run(args: &Args, config: &CoaddConfig) -> ifucoadd::Result<()> {
    let paths = match &args.list {
        Some(list) => CubeList::from_file(list)?.find_files(&args.ctype)?,
        None => expand_patterns(&args.inputs)?,
    };
    log::info!("coadding {} cubes", paths.len());
    let (out, var_out) = run_coadd(&paths, config)?;
    println!("{}", out.display());
    if let Some(var_out) = var_out {
        println!("{}", var_out.display());
    }
    Ok(())
}

fn main() {
    let args = Args::parse();
    let result = config_from_args(&args).and_then(|config| {
        let level = if config.verbose { "debug" } else { "info" };
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
        run(&args, &config)
    });
    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
