pub mod capture;
pub mod circles;
pub mod locator;
pub mod review;

pub use capture::{AdbCapture, ScreenCapture, StaticScreenshot};
pub use circles::{CircleDetector, HoughCircleDetector, MarkerDetection};
pub use locator::{CircleItemLocator, ItemLocator, LocatedItem};
pub use review::{ReviewKey, Reviewer, TerminalReviewer};
