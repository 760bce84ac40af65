use std::path::Path;

use tracing::{debug, info};

use crate::{
    error::try_io,
    exec::{run_checked, Environment},
    fs::Directory,
    Error, ImageRunner,
};

use super::RuleTable;

/// File, relative to the image root, created after the first-run commands
/// of the configuration succeed.
pub const MARKER_PATH: &str = "ch/fakeroot-first-run";

impl RuleTable {
    /// Run the first-run commands of the configuration for `image`, if
    /// they were not executed before.
    ///
    /// Commands run in order, with `/bin/sh -c`. The marker file is
    /// created only when all of them succeed, so a failed initialization
    /// is repeated from the first command in the next call.
    ///
    /// The marker is resolved inside the image, like the files of the
    /// rules, so symlinks in the image can't place it on the host.
    ///
    /// There is no locking: concurrent calls for the same image may run
    /// the commands more than once.
    pub fn ensure_initialized(
        &self,
        image: &Path,
        runner: &dyn ImageRunner,
        env: &Environment,
    ) -> Result<(), Error> {
        let Some(config) = self.resolve(image)? else {
            return Ok(());
        };

        let marker = image.join(MARKER_PATH);
        let root = try_io!(image, Directory::new(image));

        if try_io!(&marker, root.contains(MARKER_PATH)) {
            debug!(image = %image.display(), "fakeroot: already initialized");
            return Ok(());
        }

        info!(config = %config.name, "fakeroot: initializing");

        for command in &config.first_run {
            info!("fakeroot: $ {command}");

            let argv = ["/bin/sh".to_owned(), "-c".to_owned(), command.clone()];
            run_checked(runner, image, &argv, env)?;
        }

        try_io!(&marker, root.create_file(MARKER_PATH));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        exec::testing::RecordingRunner,
        fakeroot::{image_with, Configuration, Rule},
    };

    fn table() -> RuleTable {
        let config = Configuration::new("test")
            .first_run(["one", "two", "three"])
            .sensitive(["apt-get"])
            .prefix(["fakeroot"]);

        RuleTable::new(vec![Rule::new("/etc/os-release", "^ID=test$", config).unwrap()])
    }

    fn commands(calls: Vec<Vec<String>>) -> Vec<String> {
        calls
            .into_iter()
            .map(|argv| {
                assert_eq!(argv[..2], ["/bin/sh", "-c"]);
                argv[2].clone()
            })
            .collect()
    }

    #[test]
    fn initialize_once() {
        let image = image_with(&[("etc/os-release", "ID=test\n")]);
        let runner = RecordingRunner::default();
        let table = table();

        table.ensure_initialized(image.path(), &runner, &[]).unwrap();
        assert_eq!(commands(runner.take_calls()), ["one", "two", "three"]);
        assert!(image.path().join(MARKER_PATH).exists());

        table.ensure_initialized(image.path(), &runner, &[]).unwrap();
        assert!(runner.take_calls().is_empty());
    }

    #[test]
    fn failed_command_keeps_marker_absent() {
        let image = image_with(&[("etc/os-release", "ID=test\n")]);
        let runner = RecordingRunner::default();
        let table = table();

        runner.fail_on(Some("two"));

        for _ in 0..3 {
            let err = table
                .ensure_initialized(image.path(), &runner, &[])
                .unwrap_err();

            assert!(matches!(err, Error::CommandExecution { .. }));
            assert_eq!(commands(runner.take_calls()), ["one", "two"]);
            assert!(!image.path().join(MARKER_PATH).exists());
        }

        runner.fail_on(None);

        table.ensure_initialized(image.path(), &runner, &[]).unwrap();
        assert_eq!(commands(runner.take_calls()), ["one", "two", "three"]);
        assert!(image.path().join(MARKER_PATH).exists());
    }

    #[test]
    fn marker_stays_inside_image() {
        let host = tempfile::tempdir().unwrap();
        let image = image_with(&[("etc/os-release", "ID=test\n")]);

        // `/ch` is an absolute symlink. Inside the image, it points to a
        // directory with the same path as `host`.
        let inner = image.path().join(host.path().strip_prefix("/").unwrap());
        std::fs::create_dir_all(&inner).unwrap();
        std::os::unix::fs::symlink(host.path(), image.path().join("ch")).unwrap();

        let runner = RecordingRunner::default();
        let table = table();

        table.ensure_initialized(image.path(), &runner, &[]).unwrap();
        assert_eq!(runner.take_calls().len(), 3);

        assert!(inner.join("fakeroot-first-run").exists());
        assert_eq!(std::fs::read_dir(host.path()).unwrap().count(), 0);

        table.ensure_initialized(image.path(), &runner, &[]).unwrap();
        assert!(runner.take_calls().is_empty());
    }

    #[test]
    fn no_config_is_noop() {
        let image = image_with(&[("etc/os-release", "ID=other\n")]);
        let runner = RecordingRunner::default();

        table().ensure_initialized(image.path(), &runner, &[]).unwrap();

        assert!(runner.take_calls().is_empty());
        assert!(!image.path().join("ch").exists());
    }
}
