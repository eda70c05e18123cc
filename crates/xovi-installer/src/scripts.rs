//! Remote shell script templates.
//!
//! Each script is a fixed-contract artifact rendered with shell-escaped
//! parameters. Scripts are uploaded as files and executed with `sh`, never
//! assembled inline at the call site.

use crate::{
    backup::BackupComponent,
    remote::{self, sh_quote},
};

/// Marker line a restore script prints once all captured state has been
/// replayed. The UI restart that follows may drop the connection, so callers
/// look for this line instead of relying on the exit status alone.
pub const RESTORE_COMPLETE_MARKER: &str = "restore complete";

/// Marker line the hashtable rebuild script prints on success.
pub const HASHTABLE_REBUILT_MARKER: &str = "hashtable rebuild finished";

/// Path of the systemd drop-in that preloads the framework into the UI service.
const PRELOAD_DROPIN: &str = "/etc/systemd/system/xochitl.service.d/xovi.conf";

/// Shell fragment that removes the framework preload and all installed state.
fn stop_sequence() -> String {
    format!(
        "systemctl disable --now {unit} 2>/dev/null || true\n\
         rm -f {dropin}\n\
         systemctl daemon-reload\n",
        unit = remote::TRIPLETAP_UNIT,
        dropin = sh_quote(PRELOAD_DROPIN),
    )
}

/// Renders the activation script: installs the preload drop-in and restarts
/// the UI service. The restart is expected to drop the SSH connection.
pub fn render_start_script() -> String {
    format!(
        "#!/bin/sh\n\
         set -e\n\
         mkdir -p {dropin_dir}\n\
         printf '[Service]\\nEnvironment=LD_PRELOAD={binary}\\n' > {dropin}\n\
         systemctl daemon-reload\n\
         {restart}\n",
        dropin_dir = sh_quote("/etc/systemd/system/xochitl.service.d"),
        binary = remote::XOVI_BINARY,
        dropin = sh_quote(PRELOAD_DROPIN),
        restart = remote::RESTART_UI_COMMAND,
    )
}

/// Renders the deactivation script: removes the preload drop-in and restarts
/// the UI service back into its stock state.
pub fn render_stop_script() -> String {
    format!(
        "#!/bin/sh\n\
         set -e\n\
         {stop}{restart}\n",
        stop = stop_sequence(),
        restart = remote::RESTART_UI_COMMAND,
    )
}

/// Renders the hashtable rebuild script. The rebuild runs the UI binary once
/// under the framework preload so qmldiff can regenerate its hashtable; this
/// can legitimately take many minutes on a cold device.
pub fn render_hashtable_rebuild_script() -> String {
    let hashtable = format!("{}/qmldiff.hashtable", remote::XOVI_HOME);
    format!(
        "#!/bin/sh\n\
         set -e\n\
         systemctl stop {service}\n\
         QMLDIFF_HASHTABLE_CREATE={hashtable} \\\n\
         LD_PRELOAD={binary} /usr/bin/xochitl --help >/dev/null 2>&1 || true\n\
         test -s {hashtable}\n\
         echo {marker}\n",
        service = remote::UI_SERVICE,
        hashtable = sh_quote(&hashtable),
        binary = remote::XOVI_BINARY,
        marker = sh_quote(HASHTABLE_REBUILT_MARKER),
    )
}

/// Parameters for a snapshot's restore script.
pub struct RestoreScriptParams<'a> {
    /// Absolute path of the snapshot directory on the device.
    pub snapshot_dir: &'a str,
    /// Components that were actually captured in the snapshot.
    pub components: &'a [BackupComponent],
}

/// Renders a self-contained restore script for a snapshot.
///
/// The script removes all current framework and launcher state, replays
/// whatever the snapshot captured (a snapshot of a clean device replays
/// nothing and simply confirms the removal), then restarts the UI service.
pub fn render_restore_script(params: &RestoreScriptParams<'_>) -> String {
    let mut script = String::from("#!/bin/sh\nset -e\n");
    script.push_str(&format!("echo 'restoring snapshot' {}\n", sh_quote(params.snapshot_dir)));
    script.push_str(&stop_sequence());
    script.push_str(&format!(
        "rm -rf {xovi} {shims} {tripletap}\n",
        xovi = sh_quote(remote::XOVI_HOME),
        shims = sh_quote(remote::SHIMS_DIR),
        tripletap = sh_quote(remote::TRIPLETAP_DIR),
    ));
    for component in params.components {
        let source = format!("{}/{}", params.snapshot_dir, component.snapshot_name());
        match component {
            BackupComponent::Framework => script.push_str(&format!(
                "cp -a {} {}\n",
                sh_quote(&source),
                sh_quote(remote::XOVI_HOME)
            )),
            BackupComponent::Shims => script.push_str(&format!(
                "cp -a {} {}\n",
                sh_quote(&source),
                sh_quote(remote::SHIMS_DIR)
            )),
            BackupComponent::Tripletap => {
                script.push_str(&format!(
                    "cp -a {} {}\n",
                    sh_quote(&source),
                    sh_quote(remote::TRIPLETAP_DIR)
                ));
                script.push_str(&format!(
                    "systemctl enable {} 2>/dev/null || true\n",
                    remote::TRIPLETAP_UNIT
                ));
            }
            BackupComponent::DeviceConfig => script.push_str(&format!(
                "cp {} {}\n",
                sh_quote(&source),
                sh_quote(remote::XOCHITL_CONF)
            )),
        }
    }
    script.push_str(&format!("echo {}\n", sh_quote(RESTORE_COMPLETE_MARKER)));
    script.push_str(remote::RESTART_UI_COMMAND);
    script.push('\n');
    script
}
