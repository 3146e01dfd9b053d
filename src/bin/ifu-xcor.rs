//! Measure wavelength-axis corrections by cross-correlating sky spectra, and
//! optionally spatial corrections by centroiding a source of known position,
//! and write them as a WCS correction table.
//!
//! ```text
//! ifu-xcor night1.list
//! ifu-xcor night1.list --radec 150.1204 2.2051 --box 8
//! ```
use std::path::PathBuf;

use clap::Parser;
use ifucoadd::align::xcor_crpix3;
use ifucoadd::astrometry::fit_crpix12;
use ifucoadd::table::{CubeList, WcsCorrection, WcsCorrectionTable};
use ifucoadd::{Cube, IfuError};

#[derive(Parser, Debug)]
#[command(version, about = "Align cube wavelength axes using their sky spectra")]
struct Args {
    /// cube list naming the exposures
    list: PathBuf,

    /// cube type carrying the science WCS
    #[arg(long, default_value = "icubes.fits")]
    ctype: String,

    /// spaxels excluded along each x edge when summing sky spectra
    #[arg(long, default_value_t = 2)]
    xmargin: usize,

    /// spaxels excluded along each y edge when summing sky spectra
    #[arg(long, default_value_t = 2)]
    ymargin: usize,

    /// RA and Dec (degrees) of a source to register CRPIX1/2 on; without it
    /// the spatial WCS is copied unchanged
    #[arg(long, num_args = 2, value_names = ["RA", "DEC"], allow_negative_numbers = true)]
    radec: Option<Vec<f64>>,

    /// width of the source search box in arcsec
    #[arg(long = "box", default_value_t = 10.0, requires = "radec")]
    box_size: f64,

    /// output table, defaults to the cube list with a .wcs extension
    #[arg(short, long)]
    out: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

fn run(args: &Args) -> ifucoadd::Result<PathBuf> {
    let list = CubeList::from_file(&args.list)?;
    let files = list.find_files(&args.ctype)?;
    let mut ids = vec![];
    let mut cubes = vec![];
    let mut skies = vec![];
    for file in &files {
        let name = file.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let id = list
            .ids
            .iter()
            .find(|id| name.contains(id.as_str()))
            .cloned()
            .unwrap_or_else(|| name.to_string());
        let sky_path = file.with_file_name(name.replace("icube", "scube"));
        log::debug!("{}: sky spectrum from {}", id, sky_path.display());
        ids.push(id);
        cubes.push(Cube::from_fits(file)?);
        skies.push(Cube::from_fits(&sky_path)?);
    }
    if cubes.is_empty() {
        return Err(IfuError::Table(format!(
            "no {} files found for {}",
            args.ctype,
            args.list.display()
        )));
    }

    let crpix3 = xcor_crpix3(&skies, args.xmargin, args.ymargin)?;
    let rows = ids
        .into_iter()
        .zip(cubes.iter())
        .zip(crpix3)
        .map(|((id, cube), crpix3)| -> ifucoadd::Result<WcsCorrection> {
            let hdr = &cube.header;
            let (crval, crpix) = match args.radec.as_deref() {
                Some(&[ra, dec]) => {
                    let (crpix1, crpix2) = fit_crpix12(cube, (ra, dec), args.box_size)?;
                    log::info!("{}: source centroid at CRPIX1/2 = {:.3}, {:.3}", id, crpix1, crpix2);
                    ([ra, dec], [crpix1, crpix2])
                }
                _ => (
                    [hdr.float("CRVAL1")?, hdr.float("CRVAL2")?],
                    [hdr.float("CRPIX1")?, hdr.float("CRPIX2")?],
                ),
            };
            Ok(WcsCorrection {
                id,
                crval: [crval[0], crval[1], hdr.float("CRVAL3")?],
                crpix: [crpix[0], crpix[1], crpix3],
            })
        })
        .collect::<ifucoadd::Result<Vec<_>>>()?;
    let table = WcsCorrectionTable {
        input_directory: list.input_directory.clone(),
        search_depth: list.search_depth,
        rows,
    };

    let out = args
        .out
        .clone()
        .unwrap_or_else(|| args.list.with_extension("wcs"));
    table.to_file(&out)?;
    Ok(out)
}

fn main() {
    let args = Args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match run(&args) {
        Ok(out) => log::info!("saved corrections table to {}", out.display()),
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    }
}
