//! Build and host machine descriptions.
//!
//! The configure phase keeps one record per machine kind. Values come from
//! `uname`-style data on the running system and are refined later by
//! toolchain triple parsing.

use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MachineKind {
    Build,
    Host,
}

impl MachineKind {
    pub const ALL: [Self; 2] = [Self::Build, Self::Host];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Build => "build_machine",
            Self::Host => "host_machine",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

#[derive(Debug, Clone)]
pub struct Machine {
    pub system: String,
    pub cpu: String,
    pub cpu_family: String,
    pub endian: Endianness,
}

impl Machine {
    /// Describe the machine the tool itself runs on.
    #[must_use]
    pub fn detect() -> Self {
        let system = normalize_system(env::consts::OS);
        let cpu = env::consts::ARCH.to_owned();
        Self {
            cpu_family: cpu_family_for(&cpu),
            endian: if cfg!(target_endian = "big") { Endianness::Big } else { Endianness::Little },
            system,
            cpu,
        }
    }

    /// Refine from a `dumpmachine`-style target triple, e.g.
    /// `x86_64-pc-linux-gnu`. Unknown fields are left untouched.
    pub fn refine_from_triple(&mut self, triple: &str) {
        let mut parts = triple.trim().split('-');
        if let Some(cpu) = parts.next()
            && !cpu.is_empty()
        {
            self.cpu = cpu.to_owned();
            self.cpu_family = cpu_family_for(cpu);
        }
        for part in parts {
            let sys = normalize_system(part);
            if matches!(sys.as_str(), "linux" | "darwin" | "windows" | "freebsd" | "netbsd" | "openbsd")
            {
                self.system = sys;
            }
        }
    }
}

fn normalize_system(os: &str) -> String {
    match os {
        "macos" => "darwin".to_owned(),
        other => other.to_owned(),
    }
}

/// Collapse cpu names into meson-style families.
#[must_use]
pub fn cpu_family_for(cpu: &str) -> String {
    match cpu {
        "amd64" | "x64" | "x86_64" => "x86_64".to_owned(),
        "i386" | "i486" | "i586" | "i686" | "x86" => "x86".to_owned(),
        "arm64" | "aarch64" => "aarch64".to_owned(),
        c if c.starts_with("arm") => "arm".to_owned(),
        c if c.starts_with("riscv64") => "riscv64".to_owned(),
        c if c.starts_with("ppc64") || c.starts_with("powerpc64") => "ppc64".to_owned(),
        other => other.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("x86_64", "x86_64")]
    #[case("amd64", "x86_64")]
    #[case("i686", "x86")]
    #[case("aarch64", "aarch64")]
    #[case("armv7l", "arm")]
    fn maps_cpu_to_family(#[case] cpu: &str, #[case] family: &str) {
        assert_eq!(cpu_family_for(cpu), family);
    }

    #[rstest]
    fn refines_from_gcc_triple() {
        let mut m = Machine {
            system: "unknown".into(),
            cpu: "unknown".into(),
            cpu_family: "unknown".into(),
            endian: Endianness::Little,
        };
        m.refine_from_triple("x86_64-pc-linux-gnu");
        assert_eq!(m.cpu_family, "x86_64");
        assert_eq!(m.system, "linux");
    }

    #[rstest]
    fn detect_reports_running_system() {
        let m = Machine::detect();
        assert!(!m.system.is_empty());
        assert!(!m.cpu_family.is_empty());
    }
}
