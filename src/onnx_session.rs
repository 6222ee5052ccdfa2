//! ONNX Runtime session construction and device selection.

use anyhow::Result;
use log::Level;
use ort::{
    execution_providers::{CPUExecutionProvider, CoreMLExecutionProvider, ExecutionProvider},
    logging::LogLevel,
    session::Session,
};
use std::path::Path;

fn log_level_from_ort(level: LogLevel) -> Level {
    match level {
        LogLevel::Verbose => Level::Trace,
        LogLevel::Info => Level::Trace,
        LogLevel::Warning => Level::Debug,
        LogLevel::Error => Level::Info,
        LogLevel::Fatal => Level::Error,
    }
}

fn ort_level_from_log(level: Level) -> LogLevel {
    match level {
        // we skip mapping to info because ONNX's info is so verbose
        // that it is more like debug or trace
        Level::Trace => LogLevel::Verbose,
        Level::Debug => LogLevel::Warning,
        Level::Info => LogLevel::Error,
        Level::Warn => LogLevel::Error,
        Level::Error => LogLevel::Fatal,
    }
}

/// Device selection result
#[derive(Debug, Clone)]
pub struct DeviceSelection {
    pub device: String,
    pub reason: String,
}

/// Determine optimal device based on user preference
pub fn determine_optimal_device(requested_device: &str) -> DeviceSelection {
    match requested_device {
        "auto" => {
            let coreml = CoreMLExecutionProvider::default();
            match coreml.is_available() {
                Ok(true) => DeviceSelection {
                    device: "coreml".to_string(),
                    reason: "Auto-selected CoreML (available)".to_string(),
                },
                _ => DeviceSelection {
                    device: "cpu".to_string(),
                    reason: "Auto-selected CPU (CoreML not available)".to_string(),
                },
            }
        }
        other => DeviceSelection {
            device: other.to_string(),
            reason: format!("User explicitly chose {other}"),
        },
    }
}

/// Create an ONNX Runtime session for the model file at `model_path`.
pub fn create_session(model_path: &Path, device: &str) -> Result<Session> {
    let selection = determine_optimal_device(device);
    log::debug!("Device: {} ({})", selection.device, selection.reason);

    let execution_providers = match selection.device.as_str() {
        "coreml" => match CoreMLExecutionProvider::default().is_available() {
            Ok(true) => vec![
                CoreMLExecutionProvider::default().build(),
                CPUExecutionProvider::default().build(),
            ],
            _ => {
                log::warn!("CoreML not available, falling back to CPU");
                vec![CPUExecutionProvider::default().build()]
            }
        },
        "cpu" => vec![CPUExecutionProvider::default().build()],
        other => {
            log::warn!("Unknown device '{other}', using CPU");
            vec![CPUExecutionProvider::default().build()]
        }
    };

    // Choose the ORT log level based on what is enabled for us
    let ort_log_level = [
        Level::Trace,
        Level::Debug,
        Level::Info,
        Level::Warn,
        Level::Error,
    ]
    .into_iter()
    .find(|&lvl| log::log_enabled!(lvl))
    .map(ort_level_from_log)
    .unwrap_or(LogLevel::Fatal);

    let session = Session::builder()
        .map_err(|e| anyhow::anyhow!("Failed to create session builder: {}", e))?
        .with_logger(Box::new(|level, _, _, _, msg| {
            // relog to our standard logger after mapping the level
            let log_level = log_level_from_ort(level);
            log::log!(log_level, "[onnx] {msg}")
        }))
        .map_err(|e| anyhow::anyhow!("Failed to set logger: {}", e))?
        .with_log_level(ort_log_level)
        .map_err(|e| anyhow::anyhow!("Failed to set log level: {}", e))?
        .with_execution_providers(execution_providers)
        .map_err(|e| anyhow::anyhow!("Failed to set execution providers: {}", e))?
        .commit_from_file(model_path)
        .map_err(|e| {
            anyhow::anyhow!("Failed to load model from {}: {}", model_path.display(), e)
        })?;

    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_device_is_honored() {
        let selection = determine_optimal_device("cpu");
        assert_eq!(selection.device, "cpu");
        assert!(selection.reason.contains("explicitly"));
    }

    #[test]
    fn test_auto_resolves_to_concrete_device() {
        let selection = determine_optimal_device("auto");
        assert!(selection.device == "cpu" || selection.device == "coreml");
    }
}
