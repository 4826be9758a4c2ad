use std::collections::HashSet;

use crate::storage::PackagesConfig;

/// How the policy treats a foreground package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageClass {
    /// This app.
    Own,
    /// Dialer/SMS default, or the target of the current session.
    Allowed,
    Launcher,
    /// Expected in passing during an app switch (system UI, permission
    /// brokers).
    Transient,
    /// Settings surfaces that get a redirect burst.
    ForceRedirect,
    Other,
}

/// Package sets from [`PackagesConfig`], classified with a fixed precedence:
/// own, allowed, launcher, transient, force-redirect.
#[derive(Debug, Clone)]
pub struct PackagePolicy {
    own: String,
    allowed: HashSet<String>,
    launchers: HashSet<String>,
    transient: HashSet<String>,
    force_redirect: HashSet<String>,
    permission_settings: HashSet<String>,
}

impl PackagePolicy {
    pub fn from_config(packages: &PackagesConfig) -> Self {
        let set = |v: &[String]| v.iter().cloned().collect::<HashSet<_>>();
        let mut allowed = set(&packages.dialer_packages);
        allowed.extend(packages.sms_packages.iter().cloned());
        Self {
            own: packages.own_package.clone(),
            allowed,
            launchers: set(&packages.launcher_packages),
            transient: set(&packages.transient_packages),
            force_redirect: set(&packages.force_redirect_packages),
            permission_settings: set(&packages.permission_settings_packages),
        }
    }

    pub fn own_package(&self) -> &str {
        &self.own
    }

    /// Whether `package` is on the static allow-list.
    pub fn is_allow_listed(&self, package: &str) -> bool {
        self.allowed.contains(package)
    }

    pub fn is_force_redirect(&self, package: &str) -> bool {
        self.force_redirect.contains(package)
    }

    /// Where the overlay permission is granted back.
    pub fn is_permission_settings(&self, package: &str) -> bool {
        self.permission_settings.contains(package)
    }

    /// Classify `package`; `session_target` is the package remembered by
    /// the current allowed-app session, if any.
    pub fn classify(&self, package: &str, session_target: Option<&str>) -> PackageClass {
        if package == self.own {
            PackageClass::Own
        } else if self.allowed.contains(package) || session_target == Some(package) {
            PackageClass::Allowed
        } else if self.launchers.contains(package) {
            PackageClass::Launcher
        } else if self.transient.contains(package) {
            PackageClass::Transient
        } else if self.force_redirect.contains(package) {
            PackageClass::ForceRedirect
        } else {
            PackageClass::Other
        }
    }
}

impl Default for PackagePolicy {
    fn default() -> Self {
        Self::from_config(&PackagesConfig::default())
    }
}
