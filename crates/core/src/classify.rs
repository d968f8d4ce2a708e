use std::cmp::Ordering;

use tracing::{info, warn};

use crate::error::CloneError;
use crate::model::{DeviceInfo, DevicePair};

/// Picks source and destination from an unordered candidate list.
///
/// The smallest device by size is always the source and the largest is
/// always the destination, regardless of list order. With more than two
/// candidates the middle devices are ignored for this clone. Ties fall to
/// first-seen order (stable sort); that is a deliberate simplification.
pub fn classify(devices: &[DeviceInfo]) -> Result<DevicePair, CloneError> {
    if devices.len() < 2 {
        return Err(CloneError::InsufficientDevices {
            found: devices.len(),
        });
    }

    let mut ordered: Vec<&DeviceInfo> = devices.iter().collect();
    // size_gb is the pre-rounded comparison key, see catalog::round_gb
    ordered.sort_by(|a, b| a.size_gb.partial_cmp(&b.size_gb).unwrap_or(Ordering::Equal));

    let source = ordered[0].clone();
    let destination = ordered[ordered.len() - 1].clone();
    if ordered.len() > 2 {
        info!(
            "{} middle-sized device(s) ignored for this clone",
            ordered.len() - 2
        );
    }

    info!(
        "selected source: {} ({:.2}GB - {})",
        source.path, source.size_gb, source.model
    );
    info!(
        "selected destination: {} ({:.2}GB - {})",
        destination.path, destination.size_gb, destination.model
    );

    let (ok, reason) = validate(&source, &destination);
    if ok {
        // There is no destination-content check: whatever is on the
        // destination gets overwritten without confirmation.
        warn!(
            "destination {} is not checked for existing data and will be overwritten",
            destination.path
        );
    } else {
        warn!(
            "refusing pair: source {:.2}GB exceeds destination {:.2}GB",
            source.size_gb, destination.size_gb
        );
    }

    Ok(DevicePair {
        source,
        destination,
        ok,
        reason,
    })
}

/// The only safety check performed on a pair: the destination must be at
/// least as large as the source. Equality passes.
pub fn validate(source: &DeviceInfo, destination: &DeviceInfo) -> (bool, Option<String>) {
    if source.size_bytes > destination.size_bytes {
        (false, Some("destination too small".to_string()))
    } else {
        (true, None)
    }
}
