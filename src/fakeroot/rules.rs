//! Builtin rules.
//!
//! There are three implementations of fakeroot: `fakeroot`, `fakeroot-ng`
//! and `pseudo`. `fakeroot` is preferred when the distribution ships it,
//! then `pseudo` (which supports more architectures than `fakeroot-ng`).

use super::{Configuration, Rule, RuleTable};

/// Programs that change file ownership in RPM-based images.
const RPM_SENSITIVE: [&str; 3] = ["dnf", "rpm", "yum"];

const DEB_SENSITIVE: [&str; 3] = ["apt", "apt-get", "dpkg"];

pub(super) fn builtin() -> RuleTable {
    let rules = [
        (
            "/etc/redhat-release",
            r"release 7\.",
            Configuration::new("CentOS/RHEL 7")
                .first_run([
                    "yum install -y epel-release",
                    "yum install -y fakeroot",
                ])
                .sensitive(RPM_SENSITIVE)
                .prefix(["fakeroot"]),
        ),
        (
            "/etc/redhat-release",
            r"release 8\.",
            Configuration::new("CentOS/RHEL 8")
                .first_run([
                    "dnf install -y epel-release",
                    "dnf install -y fakeroot",
                ])
                .sensitive(RPM_SENSITIVE)
                .prefix(["fakeroot"]),
        ),
        // apt runs as the unprivileged `_apt` user, which fails in an
        // unprivileged container because it can't drop privileges. The
        // sandbox is disabled before anything else.
        (
            "/etc/debian_version",
            r"^(9|10)\.",
            Configuration::new("Debian 9 (Stretch) or 10 (Buster)")
                .first_run([
                    r#"echo 'APT::Sandbox::User "root";' > /etc/apt/apt.conf.d/no-sandbox"#,
                    // Base images have no package indexes.
                    "apt-get update",
                    "apt-get install -y pseudo",
                ])
                .sensitive(DEB_SENSITIVE)
                .prefix(["fakeroot"]),
        ),
    ];

    RuleTable::new(
        rules
            .into_iter()
            .map(|(path, pattern, config)| {
                Rule::new(path, pattern, config).expect("builtin patterns are valid")
            })
            .collect(),
    )
}

#[test]
fn builtin_rules_order() {
    let table = builtin();
    let names: Vec<_> = table.rules().iter().map(|r| r.config().name.as_str()).collect();

    assert_eq!(names.len(), 3);
    assert!(names[0].contains("RHEL 7"));
    assert!(names[1].contains("RHEL 8"));
    assert!(names[2].starts_with("Debian"));

    for rule in table.rules() {
        assert!(!rule.config().first_run.is_empty());
        assert_eq!(rule.config().prefix, ["fakeroot"]);
    }
}
