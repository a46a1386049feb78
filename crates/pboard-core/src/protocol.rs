use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{info, warn};

const DESKTOP_ENTRY_FILE: &str = "pulseboard.desktop";

/// How the running binary was launched, which changes what the OS must be
/// told to re-invoke on a deep link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationMode {
    /// Packaged install: the executable alone handles the URL.
    Packaged,
    /// Unpackaged checkout: the executable needs the launch script passed
    /// back as an explicit argument.
    Development { launch_script: PathBuf },
}

/// Register this application as the OS handler for `scheme`.
///
/// Returns whether registration succeeded. Failure is logged and never
/// propagated: a packaged installer may have registered the scheme on its
/// own, so the caller continues either way.
pub fn register_protocol(scheme: &str, mode: &RegistrationMode) -> bool {
    let exe = match env::current_exe() {
        Ok(path) => path,
        Err(err) => {
            warn!(%err, scheme, "cannot resolve executable path; skipping scheme registration");
            return false;
        }
    };

    let args = relaunch_args(&exe, mode);
    match register_with_os(scheme, &args) {
        Ok(()) => {
            info!(scheme, "registered custom URI scheme handler");
            true
        }
        Err(err) => {
            warn!(%err, scheme, "scheme registration failed; continuing without it");
            false
        }
    }
}

/// Arguments the OS must pass when relaunching us for a deep link.
///
/// In development the launch script is resolved to an absolute path against
/// the executable's own directory, never the current working directory: the
/// OS may start the handler from anywhere.
pub fn relaunch_args(exe: &Path, mode: &RegistrationMode) -> Vec<String> {
    let mut args = vec![exe.display().to_string()];
    if let RegistrationMode::Development { launch_script } = mode {
        let script = if launch_script.is_absolute() {
            launch_script.clone()
        } else {
            exe.parent()
                .map(|dir| dir.join(launch_script))
                .unwrap_or_else(|| launch_script.clone())
        };
        args.push(script.display().to_string());
    }
    args
}

#[cfg(target_os = "linux")]
fn register_with_os(scheme: &str, relaunch: &[String]) -> std::io::Result<()> {
    let applications = dirs::data_dir()
        .ok_or_else(|| std::io::Error::other("no XDG data directory"))?
        .join("applications");
    fs::create_dir_all(&applications)?;

    let entry_path = applications.join(DESKTOP_ENTRY_FILE);
    fs::write(&entry_path, desktop_entry(scheme, relaunch))?;

    let status = Command::new("xdg-mime")
        .args([
            "default",
            DESKTOP_ENTRY_FILE,
            &format!("x-scheme-handler/{scheme}"),
        ])
        .status()?;
    if !status.success() {
        return Err(std::io::Error::other(format!(
            "xdg-mime exited with {status}"
        )));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn register_with_os(scheme: &str, _relaunch: &[String]) -> std::io::Result<()> {
    // Windows and macOS registration rides on the installer bundle metadata.
    Err(std::io::Error::other(format!(
        "no runtime registration path for x-scheme-handler/{scheme} on this platform"
    )))
}

#[cfg(any(target_os = "linux", test))]
fn desktop_entry(scheme: &str, relaunch: &[String]) -> String {
    let exec = relaunch
        .iter()
        .map(|arg| format!("\"{arg}\""))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "[Desktop Entry]\n\
         Type=Application\n\
         Name=Pulseboard\n\
         Exec={exec} %u\n\
         Terminal=false\n\
         NoDisplay=true\n\
         MimeType=x-scheme-handler/{scheme};\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packaged_mode_relaunches_with_executable_only() {
        let args = relaunch_args(Path::new("/opt/pulseboard/pboard"), &RegistrationMode::Packaged);
        assert_eq!(args, ["/opt/pulseboard/pboard"]);
    }

    #[test]
    fn dev_script_resolves_against_executable_directory() {
        let mode = RegistrationMode::Development {
            launch_script: PathBuf::from("run-dev.sh"),
        };
        let args = relaunch_args(Path::new("/home/me/src/pboard/target/debug/pboard"), &mode);
        assert_eq!(
            args,
            [
                "/home/me/src/pboard/target/debug/pboard",
                "/home/me/src/pboard/target/debug/run-dev.sh",
            ]
        );
    }

    #[test]
    fn absolute_dev_script_is_kept_verbatim() {
        let mode = RegistrationMode::Development {
            launch_script: PathBuf::from("/home/me/src/pboard/run-dev.sh"),
        };
        let args = relaunch_args(Path::new("/anywhere/pboard"), &mode);
        assert_eq!(args[1], "/home/me/src/pboard/run-dev.sh");
    }

    #[test]
    fn desktop_entry_declares_scheme_handler() {
        let entry = desktop_entry("pulseboard", &["/opt/pboard".to_string()]);
        assert!(entry.contains("MimeType=x-scheme-handler/pulseboard;"));
        assert!(entry.contains("Exec=\"/opt/pboard\" %u"));
    }
}
