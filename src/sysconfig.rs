// Sapphillon
// SPDX-FileCopyrightText: 2025 Yuta Takahashi
// SPDX-License-Identifier: MPL-2.0 OR GPL-3.0-or-later

/// Static identity of the harness binary.
pub fn sysconfig() -> SysConfig {
    SysConfig {
        app_name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        authors: env!("CARGO_PKG_AUTHORS"),
        copyright_year: 2025,
        host_name: "ComfyUI",
    }
}

#[derive(Debug, Clone)]
pub struct SysConfig {
    pub app_name: &'static str,
    pub version: &'static str,
    pub authors: &'static str,
    pub copyright_year: u16,
    /// The server whose custom nodes are exercised.
    pub host_name: &'static str,
}

impl SysConfig {
    /// Banner printed once at startup, one log line per text line.
    pub fn app_info(&self) -> String {
        format!(
            "----------------------------------------\n\
            {} - Version: {}\n\
            Authors: {}\n\
            Copyright {} {}\n\
            \n\
            Install/uninstall test harness for {} custom nodes\n\
            Licensed under the GNU General Public License v3.0 or later\n\
            ----------------------------------------",
            self.app_name,
            self.version,
            self.authors,
            self.copyright_year,
            self.authors,
            self.host_name
        )
    }

    /// `User-Agent` sent with every request to the host.
    pub fn user_agent(&self) -> String {
        format!("{}/{}", self.app_name, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_info_names_app_and_host() {
        let info = sysconfig().app_info();
        assert!(info.contains("node-harness - Version: "));
        assert!(info.contains("for ComfyUI custom nodes"));
    }

    #[test]
    fn test_user_agent_carries_version() {
        assert_eq!(
            sysconfig().user_agent(),
            format!("node-harness/{}", env!("CARGO_PKG_VERSION"))
        );
    }
}
