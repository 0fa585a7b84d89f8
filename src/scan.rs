//! Scan request parameters

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::{NyxError, Result};

/// Detector-facing description of one rotation scan. Every field except
/// `num_images_per_file` is required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanParameters {
    /// Degrees
    pub angle_start: f64,
    /// Total rotation in degrees
    pub scan_width: f64,
    /// Seconds
    pub exposure_period_per_image: f64,
    pub num_images: u32,
    pub x_start_um: f64,
    pub y_start_um: f64,
    pub z_start_um: f64,
    /// Beam centre in pixels
    pub x_beam: f64,
    pub y_beam: f64,
    /// Angstrom
    pub wavelength: f64,
    pub det_distance_m: f64,
    /// May carry a directory component, which is dropped for file names
    pub file_prefix: String,
    pub data_directory_name: String,
    pub file_number_start: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_images_per_file: Option<u32>,
}

impl ScanParameters {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| NyxError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::load_from_str(&contents)
    }

    pub fn load_from_str(contents: &str) -> Result<Self> {
        let params: ScanParameters = serde_yaml::from_str(contents)?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        let numbers = [
            ("angle_start", self.angle_start),
            ("scan_width", self.scan_width),
            ("exposure_period_per_image", self.exposure_period_per_image),
            ("x_start_um", self.x_start_um),
            ("y_start_um", self.y_start_um),
            ("z_start_um", self.z_start_um),
            ("x_beam", self.x_beam),
            ("y_beam", self.y_beam),
            ("wavelength", self.wavelength),
            ("det_distance_m", self.det_distance_m),
        ];
        if let Some((name, value)) = numbers.iter().find(|(_, v)| !v.is_finite()) {
            return Err(NyxError::InvalidInput(format!("{} is not finite: {}", name, value)));
        }
        if self.exposure_period_per_image <= 0.0 {
            return Err(NyxError::InvalidInput(format!(
                "exposure_period_per_image must be positive, got {}",
                self.exposure_period_per_image
            )));
        }
        if self.num_images == 0 {
            return Err(NyxError::InvalidInput("num_images must be at least 1".to_string()));
        }
        if self.file_prefix_name().is_empty() {
            return Err(NyxError::InvalidInput(format!("file_prefix '{}' has no file name", self.file_prefix)));
        }
        if self.data_directory_name.is_empty() {
            return Err(NyxError::InvalidInput("data_directory_name must not be empty".to_string()));
        }
        Ok(())
    }

    /// Rotation covered by one image
    pub fn image_width(&self) -> f64 {
        self.scan_width / self.num_images as f64
    }

    pub fn exposure_ms(&self) -> f64 {
        self.exposure_period_per_image * 1.0e3
    }

    /// File prefix without any leading directory
    pub fn file_prefix_name(&self) -> &str {
        self.file_prefix.rsplit('/').next().unwrap_or_default()
    }
}

#[cfg(test)]
pub(crate) fn sample_scan(directory: &str) -> ScanParameters {
    ScanParameters {
        angle_start: 0.0,
        scan_width: 180.0,
        exposure_period_per_image: 0.1,
        num_images: 100,
        x_start_um: 1500.0,
        y_start_um: -250.0,
        z_start_um: 40.0,
        x_beam: 2072.5,
        y_beam: 2180.0,
        wavelength: 0.979,
        det_distance_m: 0.25,
        file_prefix: "lysozyme/lyso_1".to_string(),
        data_directory_name: directory.to_string(),
        file_number_start: 1,
        num_images_per_file: None,
    }
}
