//! Descriptor-driven detection-fix policy.
//!
//! Games enumerate joystick-class devices and read the generic desktop
//! axes plus the button page. A peripheral that reports its controls any
//! other way is either ignored or mapped wrongly, so it is re-exposed
//! through a virtual device with a fixed layout.

use openracing_hid_common::ReportDescriptor;
use openracing_hid_common::descriptor::usage_page;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionIssue {
    /// Top-level collection is not a joystick, gamepad or multi-axis controller.
    NotGameController,
    /// Axes without a single button; several games skip such devices.
    NoButtons,
    /// No axis on the generic desktop page (simulation or vendor pages only).
    NonDesktopAxes,
}

/// Every reason the descriptor would confuse a game's input layer. A
/// descriptor without any axes or buttons is not an input device and yields
/// nothing.
pub fn detection_issues(desc: &ReportDescriptor) -> Vec<DetectionIssue> {
    let axes = desc.axes().count();
    let buttons = desc.buttons().count();
    if axes == 0 && buttons == 0 {
        return Vec::new();
    }

    let mut issues = Vec::new();
    if !desc.is_game_controller() {
        issues.push(DetectionIssue::NotGameController);
    }
    if axes > 0 && buttons == 0 {
        issues.push(DetectionIssue::NoButtons);
    }
    if axes > 0
        && !desc
            .axes()
            .any(|f| f.usage_page == usage_page::GENERIC_DESKTOP)
    {
        issues.push(DetectionIssue::NonDesktopAxes);
    }
    issues
}

pub fn needs_detection_fix(desc: &ReportDescriptor) -> bool {
    !detection_issues(desc).is_empty()
}
