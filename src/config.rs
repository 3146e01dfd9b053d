use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{IfuError, Result};

/// Parameters of a coadd run.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct CoaddConfig {
    /// minimum flat-field coverage of a canvas pixel for an input to
    /// contribute to it
    pub pixel_threshold: f64,
    /// minimum exposure profile, as a fraction of its maximum, kept when
    /// trimming the mosaic
    pub exposure_threshold: f64,
    /// position angle of the output canvas in degrees
    pub position_angle: f64,
    /// also coadd the variance cubes
    pub propagate_variance: bool,
    /// divide each input's contribution by its flat-field coverage; this
    /// fills partially covered edge pixels but does not conserve flux
    pub flat_correction: bool,
    /// per-cube and per-spaxel detail in the log
    pub verbose: bool,
    /// accumulate inputs in parallel, each into a private canvas
    pub parallel_inputs: bool,
}

impl Default for CoaddConfig {
    fn default() -> Self {
        Self {
            pixel_threshold: 0.5,
            exposure_threshold: 0.1,
            position_angle: 0.0,
            propagate_variance: false,
            flat_correction: false,
            verbose: false,
            parallel_inputs: false,
        }
    }
}

impl CoaddConfig {
    /// read config from a yaml file, unspecified fields take their defaults
    pub fn from_yaml<P: AsRef<Path>>(filename: P) -> Result<Self> {
        let contents = std::fs::read_to_string(filename)?;
        let config: Self = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml<P: AsRef<Path>>(&self, filename: P) -> Result<()> {
        std::fs::write(filename, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Read a config file if one exists, otherwise use the defaults.
    pub fn from_yaml_or_default<P: AsRef<Path>>(filename: P) -> Result<Self> {
        match Self::from_yaml(filename) {
            Err(IfuError::IOError(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(Self::default())
            }
            other => other,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.pixel_threshold) {
            return Err(IfuError::InvalidConfig(format!(
                "pixel_threshold must be within [0, 1], got {}",
                self.pixel_threshold
            )));
        }
        // the trim keeps profiles strictly above the threshold, so 1 keeps nothing
        if !(0.0..1.0).contains(&self.exposure_threshold) {
            return Err(IfuError::InvalidConfig(format!(
                "exposure_threshold must be within [0, 1), got {}",
                self.exposure_threshold
            )));
        }
        if !self.position_angle.is_finite() {
            return Err(IfuError::InvalidConfig(format!(
                "invalid position angle {}",
                self.position_angle
            )));
        }
        Ok(())
    }
}
