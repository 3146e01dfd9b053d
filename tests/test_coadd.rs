use approx::assert_relative_eq;
use ndarray::Array3;

use ifucoadd::{run_coadd, CoaddConfig, CoaddInput, CoaddStage, Coadder, Cube, Header, IfuError};

const SCALE: f64 = 0.3 / 3600.0;

fn header(crpix: [f64; 2], cd33: f64, exptime: f64) -> Header {
    let mut hdr = Header::new();
    hdr.set("CTYPE1", "RA---TAN");
    hdr.set("CTYPE2", "DEC--TAN");
    hdr.set("CTYPE3", "AWAV");
    hdr.set("CRVAL1", 150.0);
    hdr.set("CRVAL2", 2.0);
    hdr.set("CRVAL3", 4000.0);
    hdr.set("CRPIX1", crpix[0]);
    hdr.set("CRPIX2", crpix[1]);
    hdr.set("CRPIX3", 1.0);
    hdr.set("CD1_1", -SCALE);
    hdr.set("CD1_2", 0.0);
    hdr.set("CD2_1", 0.0);
    hdr.set("CD2_2", SCALE);
    hdr.set("CD3_3", cd33);
    hdr.set("EXPTIME", exptime);
    hdr.set("ROTPA", 0.0);
    hdr.set("BUNIT", "FLAM16");
    hdr
}

fn uniform(shape: (usize, usize, usize), value: f64, crpix: [f64; 2], exptime: f64) -> Cube {
    Cube::new(Array3::from_elem(shape, value), header(crpix, 1.0, exptime))
}

fn coadd(inputs: Vec<CoaddInput>, config: CoaddConfig) -> ifucoadd::coadd::CoaddProduct {
    Coadder::new(config).run(inputs).unwrap()
}

#[test]
fn single_cube_conserves_flux() {
    let data = Array3::from_shape_fn((4, 6, 5), |(w, y, x)| (w * 31 + y * 7 + x) as f64 + 1.0);
    let cube = Cube::new(data, header([3.0, 2.5], 1.0, 300.0));
    let config = CoaddConfig {
        pixel_threshold: 0.0,
        exposure_threshold: 0.0,
        ..Default::default()
    };
    let product = coadd(vec![cube.clone().into()], config);
    assert_eq!(product.cube.shape(), (4, 6, 5));
    assert_relative_eq!(product.cube.data.sum(), cube.data.sum(), max_relative = 1e-9);
    assert_eq!(product.cube.header.float("NCOADD").unwrap(), 1.0);
}

#[test]
fn coadd_is_idempotent() {
    let data = Array3::from_shape_fn((3, 7, 6), |(w, y, x)| ((w + 1) * (y + 2) * (x + 3)) as f64);
    let cube = Cube::new(data, header([4.0, 3.0], 1.0, 600.0));
    let first = coadd(vec![cube.clone().into()], CoaddConfig::default());
    let second = coadd(vec![first.cube.clone().into()], CoaddConfig::default());

    assert_eq!(first.cube.shape(), cube.shape());
    assert_eq!(second.cube.shape(), cube.shape());
    for ((a, b), c) in first
        .cube
        .data
        .iter()
        .zip(second.cube.data.iter())
        .zip(cube.data.iter())
    {
        assert_relative_eq!(*a, *c, max_relative = 1e-9);
        assert_relative_eq!(*b, *c, max_relative = 1e-9);
    }
    for key in ["CRPIX1", "CRPIX2", "CRPIX3", "CRVAL1", "CRVAL2", "CRVAL3"] {
        assert_relative_eq!(
            second.cube.header.float(key).unwrap(),
            cube.header.float(key).unwrap(),
            epsilon = 1e-9
        );
    }
}

#[test]
fn identical_inputs_halve_variance() {
    let shape = (3, 5, 5);
    let inputs: Vec<CoaddInput> = (0..2)
        .map(|_| CoaddInput {
            intensity: uniform(shape, 7.0, [3.0, 3.0], 100.0),
            variance: Some(uniform(shape, 4.0, [3.0, 3.0], 100.0)),
        })
        .collect();
    let config = CoaddConfig {
        propagate_variance: true,
        ..Default::default()
    };
    let product = coadd(inputs, config);
    let var = product.variance.unwrap();
    assert_eq!(var.shape(), shape);
    for (&d, &v) in product.cube.data.iter().zip(var.data.iter()) {
        assert_relative_eq!(d, 7.0, max_relative = 1e-9);
        assert_relative_eq!(v, 2.0, max_relative = 1e-9);
    }
    assert!(product.exposure.iter().all(|&e| e == 200.0));
}

#[test]
fn exposure_weighted_mean() {
    let shape = (2, 4, 4);
    let inputs = vec![
        uniform(shape, 1.0, [2.0, 2.0], 300.0).into(),
        uniform(shape, 5.0, [2.0, 2.0], 100.0).into(),
    ];
    let product = coadd(inputs, CoaddConfig::default());
    for &d in product.cube.data.iter() {
        assert_relative_eq!(d, 2.0, max_relative = 1e-9);
    }
}

#[test]
fn low_exposure_edges_trimmed() {
    let shape = (3, 10, 10);
    let inputs = vec![
        uniform(shape, 1.0, [5.0, 5.0], 100.0).into(),
        uniform(shape, 1.0, [5.0, 5.0], 100.0).into(),
        uniform(shape, 1.0, [13.0, 13.0], 5.0).into(),
    ];
    let mut coadder = Coadder::new(CoaddConfig::default());
    let product = coadder.run(inputs).unwrap();
    assert_eq!(coadder.stage(), CoaddStage::Done);

    assert_eq!(product.trim.x, (8, 17));
    assert_eq!(product.trim.y, (8, 17));
    assert_eq!(product.trim.w, (0, 2));
    assert_eq!(product.cube.shape(), (3, 10, 10));
    assert_relative_eq!(product.cube.header.float("CRPIX1").unwrap(), 5.0, epsilon = 1e-6);
    assert_relative_eq!(product.cube.header.float("CRPIX2").unwrap(), 5.0, epsilon = 1e-6);
    for &d in product.cube.data.iter() {
        assert_relative_eq!(d, 1.0, max_relative = 1e-9);
    }
}

#[test]
fn offset_cubes_widen_canvas() {
    let shape = (5, 10, 10);
    let inputs = vec![
        uniform(shape, 1.0, [5.0, 5.0], 100.0).into(),
        uniform(shape, 1.0, [7.0, 5.0], 100.0).into(),
    ];
    let product = coadd(inputs, CoaddConfig::default());
    assert_eq!(product.cube.shape(), (5, 10, 12));
    for &d in product.cube.data.iter() {
        assert_relative_eq!(d, 1.0, max_relative = 1e-9);
    }
    assert_eq!(product.exposure[[0, 0, 0]], 100.0);
    assert_eq!(product.exposure[[0, 0, 5]], 200.0);
}

#[test]
fn parallel_inputs_match_sequential() {
    let shape = (2, 6, 6);
    let make = || -> Vec<CoaddInput> {
        vec![
            uniform(shape, 1.0, [3.0, 3.0], 100.0).into(),
            uniform(shape, 3.0, [4.5, 3.0], 50.0).into(),
            uniform(shape, 2.0, [3.0, 5.0], 80.0).into(),
        ]
    };
    let sequential = coadd(make(), CoaddConfig::default());
    let parallel = coadd(
        make(),
        CoaddConfig {
            parallel_inputs: true,
            ..Default::default()
        },
    );
    assert_eq!(sequential.cube.shape(), parallel.cube.shape());
    for (&a, &b) in sequential.cube.data.iter().zip(parallel.cube.data.iter()) {
        assert_relative_eq!(a, b, max_relative = 1e-9);
    }
}

#[test]
fn wavelength_offsets_extend_axis() {
    let shape = (4, 3, 3);
    let mut later = uniform(shape, 1.0, [2.0, 2.0], 100.0);
    later.header.set("CRVAL3", 4002.0);
    let inputs = vec![uniform(shape, 1.0, [2.0, 2.0], 100.0).into(), later.into()];
    let config = CoaddConfig {
        exposure_threshold: 0.0,
        ..Default::default()
    };
    let product = coadd(inputs, config);
    assert_eq!(product.cube.shape(), (6, 3, 3));
    assert_relative_eq!(product.cube.header.float("CRVAL3").unwrap(), 4000.0);
    assert_eq!(product.exposure[[0, 1, 1]], 100.0);
    assert_eq!(product.exposure[[2, 1, 1]], 200.0);
    assert_eq!(product.exposure[[5, 1, 1]], 100.0);
    for &d in product.cube.data.iter() {
        assert_relative_eq!(d, 1.0, max_relative = 1e-9);
    }
}

#[test]
fn counts_converted_to_rates() {
    let mut cube = uniform((2, 3, 3), 20.0, [2.0, 2.0], 10.0);
    cube.header.set("BUNIT", "electrons");
    let product = coadd(vec![cube.into()], CoaddConfig::default());
    assert_eq!(product.cube.header.text("BUNIT"), Some("electrons/sec"));
    for &d in product.cube.data.iter() {
        assert_relative_eq!(d, 2.0, max_relative = 1e-9);
    }
}

#[test]
fn mismatched_wavelength_scale_is_fatal() {
    let a = uniform((3, 4, 4), 1.0, [2.0, 2.0], 100.0);
    let b = Cube::new(Array3::ones((3, 4, 4)), header([2.0, 2.0], 2.0, 100.0));

    let mut coadder = Coadder::new(CoaddConfig::default());
    let result = coadder.run(vec![a.clone().into(), b.clone().into()]);
    assert!(matches!(result, Err(IfuError::WavelengthScale(_))));
    assert_eq!(coadder.stage(), CoaddStage::Init);

    let dir = tempfile::tempdir().unwrap();
    let paths = [dir.path().join("a_icubes.fits"), dir.path().join("b_icubes.fits")];
    a.to_fits(&paths[0]).unwrap();
    b.to_fits(&paths[1]).unwrap();
    let result = run_coadd(&paths, &CoaddConfig::default());
    assert!(matches!(result, Err(IfuError::WavelengthScale(_))));
    assert!(!dir.path().join("a_icubes.coadd.fits").exists());
}

#[test]
fn missing_variance_rejected() {
    let cube = uniform((2, 3, 3), 1.0, [2.0, 2.0], 10.0);
    let config = CoaddConfig {
        propagate_variance: true,
        ..Default::default()
    };
    let mut coadder = Coadder::new(config);
    assert!(matches!(
        coadder.run(vec![cube.into()]),
        Err(IfuError::Geometry(_))
    ));
}

#[test]
fn run_coadd_writes_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let shape = (3, 5, 5);
    let mut paths = vec![];
    for (i, crpix) in [[3.0, 3.0], [4.0, 3.0]].iter().enumerate() {
        let path = dir.path().join(format!("kb{}_icubes.fits", i));
        uniform(shape, 2.0, *crpix, 100.0).to_fits(&path).unwrap();
        uniform(shape, 0.5, *crpix, 100.0)
            .to_fits(dir.path().join(format!("kb{}_vcubes.fits", i)))
            .unwrap();
        paths.push(path);
    }
    let config = CoaddConfig {
        propagate_variance: true,
        ..Default::default()
    };
    let (out, var_out) = run_coadd(&paths, &config).unwrap();
    assert_eq!(out, dir.path().join("kb0_icubes.coadd.fits"));
    let var_out = var_out.unwrap();
    assert_eq!(var_out, dir.path().join("kb0_icubes.coadd.var.fits"));

    let mosaic = Cube::from_fits(&out).unwrap();
    assert_eq!(mosaic.shape(), (3, 5, 6));
    for &d in mosaic.data.iter() {
        assert_relative_eq!(d, 2.0, max_relative = 1e-6);
    }
    let var = Cube::from_fits(&var_out).unwrap();
    assert_eq!(var.shape(), (3, 5, 6));
    assert_relative_eq!(var.data[[1, 2, 3]], 0.25, max_relative = 1e-6);
    assert_relative_eq!(var.data[[1, 2, 0]], 0.5, max_relative = 1e-6);
}

fn gradient(shape: (usize, usize, usize), hdr: Header) -> Cube {
    let data = Array3::from_shape_fn(shape, |(w, y, x)| (w * 37 + y * 11 + x * 3) as f64 + 1.0);
    Cube::new(data, hdr)
}

fn no_thresholds() -> CoaddConfig {
    CoaddConfig {
        pixel_threshold: 0.0,
        exposure_threshold: 0.0,
        ..Default::default()
    }
}

#[test]
fn finer_canvas_conserves_flux() {
    let mut hdr = header([5.0, 5.0], 1.0, 300.0);
    hdr.set("CD1_1", -0.29 / 3600.0);
    hdr.set("CD2_2", 0.68 / 3600.0);
    let cube = gradient((2, 10, 10), hdr);
    let product = coadd(vec![cube.clone().into()], no_thresholds());
    let (_, ny, nx) = product.cube.shape();
    assert_eq!(nx, 10);
    assert!(ny > 20, "canvas has {} rows", ny);
    assert_relative_eq!(product.cube.data.sum(), cube.data.sum(), max_relative = 1e-6);
}

#[test]
fn rotated_canvas_conserves_flux() {
    let mut hdr = header([5.0, 5.0], 1.0, 300.0);
    hdr.set("ROTPA", 30.0);
    let cube = gradient((2, 10, 10), hdr);
    let product = coadd(vec![cube.clone().into()], no_thresholds());
    let (_, ny, nx) = product.cube.shape();
    assert!(nx > 10 && ny > 10);
    assert_relative_eq!(product.cube.data.sum(), cube.data.sum(), max_relative = 1e-6);
}

#[test]
fn position_angle_turns_the_canvas() {
    let cube = gradient((2, 6, 10), header([5.0, 3.0], 1.0, 300.0));
    let config = CoaddConfig {
        position_angle: 90.0,
        ..Default::default()
    };
    let product = coadd(vec![cube.clone().into()], config);
    assert_eq!(product.cube.shape(), (2, 10, 6));

    let sorted = |data: &Array3<f64>| {
        let mut v: Vec<f64> = data.iter().copied().collect();
        v.sort_by(f64::total_cmp);
        v
    };
    for (a, b) in sorted(&product.cube.data).iter().zip(sorted(&cube.data).iter()) {
        assert_relative_eq!(*a, *b, max_relative = 1e-9);
    }
}

#[test]
fn degenerate_cube_is_skipped() {
    let shape = (2, 5, 5);
    let mut tiny = header([2.0, 2.0], 1.0, 100.0);
    tiny.set("CD1_1", -SCALE * 1e-7);
    tiny.set("CD2_2", SCALE * 1e-7);
    let inputs = vec![
        uniform(shape, 1.0, [3.0, 3.0], 100.0).into(),
        Cube::new(Array3::from_elem((2, 3, 3), 50.0), tiny).into(),
    ];
    let mut coadder = Coadder::new(CoaddConfig::default());
    let product = coadder.run(inputs).unwrap();
    assert_eq!(coadder.stage(), CoaddStage::Done);
    assert_eq!(product.cube.shape(), shape);
    for &d in product.cube.data.iter() {
        assert_relative_eq!(d, 1.0, max_relative = 1e-9);
    }
    assert!(product.exposure.iter().all(|&e| e == 100.0));
    assert_eq!(product.cube.header.float("NCOADD").unwrap(), 2.0);
}

#[test]
fn verbose_run_matches_quiet_run() {
    let mut hdr = header([5.0, 5.0], 1.0, 300.0);
    hdr.set("ROTPA", 30.0);
    let cube = gradient((2, 8, 8), hdr);
    let quiet = coadd(vec![cube.clone().into()], CoaddConfig::default());
    let verbose = coadd(
        vec![cube.into()],
        CoaddConfig {
            verbose: true,
            ..Default::default()
        },
    );
    assert_eq!(quiet.cube.data, verbose.cube.data);
    assert_eq!(quiet.trim, verbose.trim);
}

#[test]
fn full_exposure_threshold_rejected() {
    let cube = uniform((2, 3, 3), 1.0, [2.0, 2.0], 10.0);
    let mut coadder = Coadder::new(CoaddConfig {
        exposure_threshold: 1.0,
        ..Default::default()
    });
    assert!(matches!(
        coadder.run(vec![cube.into()]),
        Err(IfuError::InvalidConfig(_))
    ));
    assert_eq!(coadder.stage(), CoaddStage::Init);
}
