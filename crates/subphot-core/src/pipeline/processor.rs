use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::json;
use tracing::debug;

use crate::config::{AstrometryParams, CommandTemplates, ResolvedConfig};
use crate::frame::Frame;
use crate::reference::{NewReference, ReferenceKind};

use super::stage::Stage;
use super::types::{ReferenceRequest, StageFailure, StageOutput, WorkUnit};

/// The numerical work behind every stage. The coordinator never looks
/// inside; it only records what a processor reports.
///
/// Implementations are called concurrently from pool threads.
pub trait StageProcessor: Send + Sync {
    /// Run one (frame, stage) unit, writing `unit.output`.
    fn process(&self, unit: &WorkUnit) -> Result<StageOutput, StageFailure>;

    /// Build a reference frame at `request.output`.
    fn build_reference(&self, request: &ReferenceRequest) -> Result<NewReference, StageFailure>;

    /// Measure the statistics of an already calibrated frame. Used to
    /// refill the frame-info cache when it was dropped while the
    /// calibration records were kept.
    fn measure(&self, frame: &Frame, _calibrated: &Path) -> Result<StageOutput, StageFailure> {
        Err(StageFailure::new(format!(
            "no statistics available for {}",
            frame.key
        )))
    }
}

/// Runs operator-configured shell commands.
///
/// Templates are expanded with shell-quoted placeholder values and run
/// through `sh -c`. Toggles and numeric parameters are exported as
/// `SUBPHOT_*` environment variables. A JSON file at `<output>.json`, if the
/// command writes one, is read as the unit's [`StageOutput`].
pub struct CommandProcessor {
    templates: CommandTemplates,
    env: Vec<(String, String)>,
}

impl CommandProcessor {
    pub fn new(config: &ResolvedConfig) -> Self {
        let AstrometryParams {
            max_distance,
            order,
            max_sources,
        } = config.astrometry;
        let mut env = vec![
            ("SUBPHOT_PROJECT".to_string(), config.scope.project.to_string()),
            ("SUBPHOT_SECTOR".to_string(), config.sector.label()),
            ("SUBPHOT_CAMERA".to_string(), config.scope.camera.to_string()),
            ("SUBPHOT_CCD".to_string(), config.scope.ccd.to_string()),
            ("SUBPHOT_SCID".to_string(), config.scid.to_string()),
            ("SUBPHOT_MODE".to_string(), config.mode.dir_name().to_string()),
            ("SUBPHOT_MAX_DISTANCE".to_string(), max_distance.to_string()),
            ("SUBPHOT_TRANSFORM_ORDER".to_string(), order.to_string()),
            ("SUBPHOT_MAX_SOURCES".to_string(), max_sources.to_string()),
            ("SUBPHOT_FLUX_THRESHOLD".to_string(), config.flux_threshold.to_string()),
            ("SUBPHOT_CATMATCH_ARCSEC".to_string(), config.catmatch_arcsec.to_string()),
            (
                "SUBPHOT_SUBTRACTION_METHOD".to_string(),
                config.subtraction_method().to_string(),
            ),
        ];
        env.extend(
            config
                .toggles
                .iter()
                .map(|toggle| (toggle.env_var(), "1".to_string())),
        );
        Self {
            templates: config.commands.clone(),
            env,
        }
    }

    fn template(&self, stage: Stage) -> Option<&str> {
        let t = &self.templates;
        match stage {
            Stage::Calibrate => t.calibrate.as_deref(),
            Stage::Align => t.align.as_deref(),
            Stage::Subtract => t.subtract.as_deref(),
            Stage::Photometer => t.photometer.as_deref(),
            Stage::Detrend => t.detrend.as_deref(),
            Stage::Assemble => t.assemble.as_deref(),
        }
    }

    /// Stages that have no command template.
    pub fn missing_templates(&self, stages: &[Stage]) -> Vec<Stage> {
        stages
            .iter()
            .copied()
            .filter(|s| self.template(*s).is_none())
            .collect()
    }

    fn execute(&self, command: &str) -> Result<(), StageFailure> {
        debug!(command, "Running stage command");
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .output()
            .map_err(|e| StageFailure::new(format!("failed to spawn command: {e}")))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(StageFailure::new(format!(
                "command exited with {}: {}",
                output.status,
                stderr.trim()
            )))
        }
    }
}

impl StageProcessor for CommandProcessor {
    fn process(&self, unit: &WorkUnit) -> Result<StageOutput, StageFailure> {
        let template = self
            .template(unit.stage)
            .ok_or_else(|| StageFailure::new(format!("no command configured for {}", unit.stage)))?;

        let apertures = unit
            .apertures
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let reference = unit
            .reference
            .as_ref()
            .map(|r| quote_path(&r.path))
            .unwrap_or_default();
        let command = expand(
            template,
            &[
                ("input", quote_path(unit.input())),
                ("output", quote_path(&unit.output)),
                ("reference", reference),
                ("kernel", quote(unit.kernel.as_str())),
                ("apertures", quote(&apertures)),
                ("frame", quote(unit.frame.key.as_str())),
            ],
        );
        self.execute(&command)?;

        if !unit.output.exists() {
            return Err(StageFailure::new(format!(
                "command did not produce {}",
                unit.output.display()
            )));
        }
        read_sidecar(&unit.output)
    }

    fn build_reference(&self, request: &ReferenceRequest) -> Result<NewReference, StageFailure> {
        let template = match request.kind {
            ReferenceKind::Astrometric => self.templates.astrometric_reference.as_deref(),
            ReferenceKind::Photometric => self.templates.photometric_reference.as_deref(),
        }
        .ok_or_else(|| {
            StageFailure::new(format!("no command configured for {} reference", request.kind))
        })?;

        let inputs = request
            .inputs
            .iter()
            .map(|p| quote_path(p))
            .collect::<Vec<_>>()
            .join(" ");
        let reference = request
            .astrometric
            .as_ref()
            .map(|r| quote_path(&r.path))
            .unwrap_or_default();
        let frame = request
            .sources
            .first()
            .map(|k| quote(k.as_str()))
            .unwrap_or_default();
        let command = expand(
            template,
            &[
                ("input", inputs),
                ("output", quote_path(&request.output)),
                ("reference", reference),
                ("frame", frame),
            ],
        );
        self.execute(&command)?;

        if !request.output.exists() {
            return Err(StageFailure::new(format!(
                "reference command did not produce {}",
                request.output.display()
            )));
        }
        let metadata = read_sidecar(&request.output)?.detail;
        Ok(NewReference {
            path: request.output.clone(),
            sources: Some(json!(request
                .sources
                .iter()
                .map(|k| k.as_str())
                .collect::<Vec<_>>())),
            metadata,
        })
    }

    /// Statistics come from the sidecar the calibration command left next
    /// to the calibrated frame.
    fn measure(&self, frame: &Frame, calibrated: &Path) -> Result<StageOutput, StageFailure> {
        let output = read_sidecar(calibrated)?;
        if output.stats.is_none() {
            return Err(StageFailure::new(format!(
                "no statistics next to {} for {}",
                calibrated.display(),
                frame.key
            )));
        }
        Ok(output)
    }
}

fn sidecar_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".json");
    PathBuf::from(name)
}

fn read_sidecar(output: &Path) -> Result<StageOutput, StageFailure> {
    let path = sidecar_path(output);
    if !path.exists() {
        return Ok(StageOutput::default());
    }
    let text = std::fs::read_to_string(&path)
        .map_err(|e| StageFailure::new(format!("failed to read {}: {e}", path.display())))?;
    serde_json::from_str(&text)
        .map_err(|e| StageFailure::new(format!("malformed {}: {e}", path.display())))
}

fn expand(template: &str, values: &[(&str, String)]) -> String {
    values
        .iter()
        .fold(template.to_string(), |acc, (name, value)| {
            acc.replace(&format!("{{{name}}}"), value)
        })
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn quote_path(path: &Path) -> String {
    quote(&path.to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_quoted() {
        let cmd = expand(
            "fitsh {input} -o {output} {unknown}",
            &[
                ("input", quote("a b.fits")),
                ("output", quote("it's.fits")),
            ],
        );
        assert_eq!(cmd, r"fitsh 'a b.fits' -o 'it'\''s.fits' {unknown}");
    }

    #[test]
    fn sidecar_sits_next_to_output() {
        assert_eq!(
            sidecar_path(Path::new("/w/x-xtrns.fits")),
            PathBuf::from("/w/x-xtrns.fits.json")
        );
    }
}
