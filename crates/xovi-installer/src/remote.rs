//! Fixed filesystem layout on the device.
//!
//! Everything in this module is an external contract: the paths are where the
//! stock firmware and the XOVI framework expect things to live, and the
//! installer treats them as immutable.

/// Framework root directory.
pub const XOVI_HOME: &str = "/home/root/xovi";
/// The framework's loadable binary.
pub const XOVI_BINARY: &str = "/home/root/xovi/xovi.so";
/// Extension home, scanned by the framework at startup.
pub const EXTENSIONS_DIR: &str = "/home/root/xovi/exthome";
/// AppLoad application directory; installable apps are placed here as subdirectories.
pub const APPLOAD_DIR: &str = "/home/root/xovi/exthome/appload";
/// Compatibility shims consumed by extensions.
pub const SHIMS_DIR: &str = "/home/root/shims";
/// Power-button-triggered helper.
pub const TRIPLETAP_DIR: &str = "/home/root/xovi-tripletap";
/// Background service definition for the tripletap helper.
pub const TRIPLETAP_UNIT: &str = "xovi-tripletap.service";
/// The device's own UI configuration. Contains the SSH password
/// (`DeveloperPassword`), which is why backups capture it.
pub const XOCHITL_CONF: &str = "/home/root/.config/remarkable/xochitl.conf";
/// Root directory for installer-created snapshots.
pub const BACKUPS_DIR: &str = "/home/root/xovi-backups";
/// Staging area for uploaded archives, cleaned at the end of an installation.
pub const STAGING_DIR: &str = "/home/root/.xovi-staging";
/// Activation wrapper script uploaded during the final activation step.
pub const START_SCRIPT: &str = "/home/root/xovi/start";
/// The UI service unit name.
pub const UI_SERVICE: &str = "xochitl";
/// Standard process-supervisor restart for the UI service.
pub const RESTART_UI_COMMAND: &str = "systemctl restart xochitl";

/// Quotes a value for safe interpolation into a remote shell command.
pub fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_plain_path() {
        assert_eq!(sh_quote("/home/root/xovi"), "'/home/root/xovi'");
    }

    #[test]
    fn quoting_embedded_single_quote() {
        assert_eq!(sh_quote("a'b"), r"'a'\''b'");
    }
}
