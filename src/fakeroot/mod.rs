//! Privilege emulation for package managers inside unprivileged images.
//!
//! A [`RuleTable`] maps distributions (detected by the contents of a file
//! in the image) to a [`Configuration`]. The configuration describes the
//! commands to prepare the image the first time it is modified, and how
//! to wrap package-manager commands with a fakeroot implementation.

mod first_run;
mod rules;

use std::{
    collections::BTreeSet,
    io::Read,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use regex::Regex;
use rustix::io::Errno;
use tracing::debug;

use crate::{error::try_io, exec::Environment, fs::Directory, Error, ImageRunner};

pub use first_run::MARKER_PATH;

static BUILTIN: LazyLock<RuleTable> = LazyLock::new(rules::builtin);

/// Setup for a distribution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Configuration {
    /// Human-readable description.
    pub name: String,

    /// Shell commands to run, in order, before the first modification.
    pub first_run: Vec<String>,

    /// Programs that need the wrapper.
    pub sensitive: BTreeSet<String>,

    /// Arguments added before a command that runs a sensitive program.
    pub prefix: Vec<String>,
}

impl Configuration {
    pub fn new(name: impl Into<String>) -> Self {
        Configuration {
            name: name.into(),
            first_run: Vec::new(),
            sensitive: BTreeSet::new(),
            prefix: Vec::new(),
        }
    }

    pub fn first_run<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.first_run.extend(commands.into_iter().map(Into::into));
        self
    }

    pub fn sensitive<I, S>(mut self, programs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sensitive.extend(programs.into_iter().map(Into::into));
        self
    }

    pub fn prefix<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefix.extend(args.into_iter().map(Into::into));
        self
    }

    /// Return `true` if any word in `argv` is a sensitive program.
    ///
    /// Arguments are split on whitespace, so a shell command line like
    /// `apt-get update && dpkg -l` is detected. Partial words (like
    /// `dpkg-deb`) are not.
    pub fn needs_wrapper(&self, argv: &[String]) -> bool {
        argv.iter()
            .flat_map(|arg| arg.split_whitespace())
            .any(|word| self.sensitive.contains(word))
    }

    /// Add the prefix to `argv` if it needs the wrapper.
    pub fn wrap(&self, argv: &[String]) -> Vec<String> {
        if self.needs_wrapper(argv) {
            self.prefix.iter().chain(argv).cloned().collect()
        } else {
            argv.to_vec()
        }
    }
}

/// Entry of a [`RuleTable`].
#[derive(Clone, Debug)]
pub struct Rule {
    path: PathBuf,
    pattern: Regex,
    config: Configuration,
}

impl Rule {
    /// `config` is selected when any line of the file at `path` (relative
    /// to the image root) matches `pattern`.
    pub fn new(
        path: impl Into<PathBuf>,
        pattern: &str,
        config: Configuration,
    ) -> Result<Self, Error> {
        Ok(Rule {
            path: path.into(),
            pattern: Regex::new(pattern)?,
            config,
        })
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Check the file of this rule in `root`. A missing file is not a match.
    fn matches(&self, root: &Directory, image: &Path) -> Result<bool, Error> {
        let path = image.join(self.path.strip_prefix("/").unwrap_or(&self.path));

        let mut file = match root.open_file(&self.path) {
            Ok(f) => f,
            Err(Errno::NOENT) => return Ok(false),
            Err(e) => return Err(Error::Filesystem(e.into(), path)),
        };

        let mut content = Vec::new();
        try_io!(&path, file.read_to_end(&mut content));

        Ok(String::from_utf8_lossy(&content)
            .lines()
            .any(|line| self.pattern.is_match(line)))
    }
}

/// Ordered list of rules. The first match wins.
#[derive(Clone, Debug)]
pub struct RuleTable {
    rules: Vec<Rule>,
}

impl RuleTable {
    pub fn new(rules: Vec<Rule>) -> Self {
        RuleTable { rules }
    }

    /// Rules for the supported distributions.
    pub fn builtin() -> &'static RuleTable {
        &BUILTIN
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Find the configuration for the image in `image`.
    ///
    /// The image root must exist. Files for each rule are resolved
    /// inside the image, so absolute symlinks don't reach the host.
    pub fn resolve(&self, image: &Path) -> Result<Option<&Configuration>, Error> {
        debug!(image = %image.display(), "fakeroot: checking configs");

        let root = try_io!(image, Directory::new(image));

        for rule in &self.rules {
            debug!(
                config = %rule.config.name,
                path = %rule.path.display(),
                pattern = %rule.pattern,
                "fakeroot: checking"
            );

            if rule.matches(&root, image)? {
                debug!(config = %rule.config.name, "fakeroot: using config");
                return Ok(Some(&rule.config));
            }
        }

        debug!("fakeroot: no config found");
        Ok(None)
    }

    /// Return the command line to execute `argv` in `image`.
    ///
    /// If a configuration matches the image, and any word in `argv` is a
    /// sensitive program, the prefix of the configuration is added once.
    /// Otherwise, `argv` is returned unchanged.
    pub fn inject_for_exec(&self, image: &Path, argv: &[String]) -> Result<Vec<String>, Error> {
        match self.resolve(image)? {
            Some(config) => Ok(config.wrap(argv)),
            None => Ok(argv.to_vec()),
        }
    }
}

/// [`RuleTable::resolve`] with the builtin rules.
pub fn resolve_config(image: &Path) -> Result<Option<&'static Configuration>, Error> {
    RuleTable::builtin().resolve(image)
}

/// [`RuleTable::inject_for_exec`] with the builtin rules.
pub fn inject_for_exec(image: &Path, argv: &[String]) -> Result<Vec<String>, Error> {
    RuleTable::builtin().inject_for_exec(image, argv)
}

/// [`RuleTable::ensure_initialized`] with the builtin rules.
pub fn ensure_initialized(
    image: &Path,
    runner: &dyn ImageRunner,
    env: &Environment,
) -> Result<(), Error> {
    RuleTable::builtin().ensure_initialized(image, runner, env)
}

#[cfg(test)]
pub(crate) fn image_with(files: &[(&str, &str)]) -> tempfile::TempDir {
    let image = tempfile::tempdir().unwrap();

    for (path, content) in files {
        let path = image.path().join(path);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    image
}

#[cfg(test)]
fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

#[test]
fn detect_builtin_distributions() {
    let debian = image_with(&[("etc/debian_version", "10.13\n")]);
    let config = resolve_config(debian.path()).unwrap().unwrap();
    assert!(config.name.starts_with("Debian"));
    assert!(config.sensitive.contains("apt-get"));

    let centos = image_with(&[(
        "etc/redhat-release",
        "CentOS Linux release 7.9.2009 (Core)\n",
    )]);
    let config = resolve_config(centos.path()).unwrap().unwrap();
    assert!(config.name.contains('7'));
    assert!(config.sensitive.contains("yum"));

    // Pattern must match a single line.
    let bookworm = image_with(&[("etc/debian_version", "12.5\n")]);
    assert_eq!(resolve_config(bookworm.path()).unwrap(), None);

    let empty = image_with(&[]);
    assert_eq!(resolve_config(empty.path()).unwrap(), None);

    // Stable across calls.
    assert_eq!(
        resolve_config(debian.path()).unwrap(),
        resolve_config(debian.path()).unwrap()
    );
}

#[test]
fn first_matching_rule_wins() {
    let table = RuleTable::new(vec![
        Rule::new("/etc/os-release", "^ID=alpine$", Configuration::new("alpine")).unwrap(),
        Rule::new("/etc/os-release", "^VERSION_ID=", Configuration::new("any")).unwrap(),
        Rule::new("/etc/os-release", "^ID=", Configuration::new("later")).unwrap(),
    ]);

    let image = image_with(&[("etc/os-release", "NAME=x\nID=alpine\nVERSION_ID=3\n")]);
    assert_eq!(table.resolve(image.path()).unwrap().unwrap().name, "alpine");

    let image = image_with(&[("etc/os-release", "ID=arch\nVERSION_ID=1\n")]);
    assert_eq!(table.resolve(image.path()).unwrap().unwrap().name, "any");
}

#[test]
fn match_files_inside_image() {
    // Absolute symlinks are resolved from the image root.
    let image = image_with(&[("usr/lib/debian_version", "9.13\n")]);
    std::fs::create_dir(image.path().join("etc")).unwrap();
    std::os::unix::fs::symlink(
        "/usr/lib/debian_version",
        image.path().join("etc/debian_version"),
    )
    .unwrap();

    let config = resolve_config(image.path()).unwrap().unwrap();
    assert!(config.name.starts_with("Debian"));
}

#[test]
fn resolve_errors() {
    let image = image_with(&[]);

    let missing = image.path().join("missing");
    assert!(matches!(
        resolve_config(&missing),
        Err(Error::Filesystem(_, p)) if p == missing
    ));

    // The file exists, but can't be read.
    std::fs::create_dir_all(image.path().join("etc/debian_version")).unwrap();
    assert!(matches!(
        resolve_config(image.path()),
        Err(Error::Filesystem(_, p)) if p.ends_with("etc/debian_version")
    ));

    assert!(matches!(
        Rule::new("/etc/issue", "(", Configuration::new("x")),
        Err(Error::InvalidPattern(_))
    ));
}

#[test]
fn inject_only_whole_words() {
    let debian = image_with(&[("etc/debian_version", "10.0\n")]);
    let inject = |args: &[&str]| inject_for_exec(debian.path(), &argv(args)).unwrap();

    assert_eq!(inject(&["dpkg-deb", "-b", "x"]), argv(&["dpkg-deb", "-b", "x"]));

    assert_eq!(
        inject(&["apt-get", "update"]),
        argv(&["fakeroot", "apt-get", "update"])
    );

    // Shell command lines are split in words, and the prefix is added once.
    assert_eq!(
        inject(&["/bin/sh", "-c", "apt-get update && dpkg -l"]),
        argv(&["fakeroot", "/bin/sh", "-c", "apt-get update && dpkg -l"])
    );

    assert_eq!(inject(&["echo", "apt-getx"]), argv(&["echo", "apt-getx"]));
}

#[test]
fn no_config_keeps_arguments() {
    let image = image_with(&[("etc/alpine-release", "3.19.0\n")]);

    let cases: [&[&str]; 3] = [&["apt-get", "update"], &["dpkg"], &[]];

    for args in cases {
        assert_eq!(
            inject_for_exec(image.path(), &argv(args)).unwrap(),
            argv(args)
        );
    }
}
