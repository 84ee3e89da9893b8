// SPDX-License-Identifier: GPL-3.0-only

//! Application-wide constants

/// Capture session defaults
pub mod capture {
    use crate::backends::camera::FrameSize;

    /// Size requested when the device offers it exactly
    pub const PREFERRED_SIZE: FrameSize = FrameSize::new(640, 480);

    /// Size used when the preferred one is not offered
    pub const FALLBACK_SIZE: FrameSize = FrameSize::new(1280, 720);

    /// Images queued or held at once (keep small for low latency)
    pub const MAX_IMAGES: usize = 2;

    /// Camera opened when none is configured
    pub const DEFAULT_CAMERA_ID: &str = "virtual:0";
}

/// Timing constants
pub mod timing {
    use std::time::Duration;

    /// Frame counter modulo for periodic logging
    pub const FRAME_LOG_INTERVAL: u64 = 30;

    /// Upper bound on waiting for the background context to terminate
    pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

    /// Minimum interval between FPS reports
    pub const FPS_REPORT_INTERVAL: Duration = Duration::from_secs(1);

    /// Redraw rate of the headless render surface
    pub const RENDER_RATE_HZ: u32 = 60;
}

/// Render loop constants
pub mod render {
    /// Weight of the previous smoothed FPS value
    pub const FPS_SMOOTHING: f64 = 0.9;

    /// FPS reports buffered for the UI thread before new ones are dropped
    pub const UI_QUEUE_CAPACITY: usize = 8;
}

/// Resolution labels for camera listings
pub fn get_resolution_label(width: u32) -> Option<&'static str> {
    match width {
        w if w >= 3840 => Some("4K"), // 3840x2160
        w if w >= 2560 => Some("2K"), // 2560x1440
        w if w >= 1920 => Some("FHD"), // 1920x1080
        w if w >= 1280 => Some("HD"), // 1280x720
        w if w >= 640 => Some("SD"),  // 640x480
        _ => None,
    }
}

/// Application information utilities
pub mod app_info {
    /// Get the application version from build-time environment
    pub fn version() -> &'static str {
        env!("GIT_VERSION")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_labels() {
        assert_eq!(get_resolution_label(3840), Some("4K"));
        assert_eq!(get_resolution_label(1920), Some("FHD"));
        assert_eq!(get_resolution_label(1280), Some("HD"));
        assert_eq!(get_resolution_label(640), Some("SD"));
        assert_eq!(get_resolution_label(320), None);
    }
}
