//! Run commands inside unpacked images.

use std::{
    ffi::OsString,
    io,
    path::Path,
    process::{Command, ExitStatus},
};

use tracing::{debug, info};

use crate::{fakeroot::RuleTable, Error, ExecFailure};

/// Environment variables for a command, in `(name, value)` pairs.
pub type Environment = [(String, String)];

/// Execute processes inside an unpacked image.
pub trait ImageRunner {
    /// Run `argv` in `image`, and wait until it exits.
    ///
    /// Errors are returned only if the process can't be started.
    fn run(&self, image: &Path, argv: &[String], env: &Environment) -> io::Result<ExitStatus>;
}

/// [`ImageRunner`] implementation using `ch-run`.
///
/// The image is mounted writable, and the process runs as (fake) root
/// in `/`, without the host home directory or `/etc/passwd`.
#[derive(Clone, Debug)]
pub struct ChRun {
    program: OsString,
}

impl Default for ChRun {
    fn default() -> Self {
        Self::new()
    }
}

impl ChRun {
    pub fn new() -> Self {
        ChRun {
            program: "ch-run".into(),
        }
    }

    /// Path of the `ch-run` program. The default is to find it in `$PATH`.
    pub fn program(mut self, program: impl Into<OsString>) -> Self {
        self.program = program.into();
        self
    }

    fn command(&self, image: &Path, argv: &[String], env: &Environment) -> Command {
        let mut command = Command::new(&self.program);

        command
            .args(["-w", "--no-home", "--no-passwd", "--cd", "/"])
            .args(["--uid=0", "--gid=0"])
            .arg(image)
            .arg("--")
            .args(argv)
            .envs(env.iter().map(|(k, v)| (k, v)));

        command
    }
}

impl ImageRunner for ChRun {
    fn run(&self, image: &Path, argv: &[String], env: &Environment) -> io::Result<ExitStatus> {
        self.command(image, argv, env).status()
    }
}

/// Run a command that modifies `image`.
///
/// The image is initialized for the matching configuration in `rules`
/// (if any), and the privilege-emulation wrapper is added to `argv`
/// when it runs a sensitive command.
pub fn run_modify(
    rules: &RuleTable,
    runner: &dyn ImageRunner,
    image: &Path,
    argv: &[String],
    env: &Environment,
) -> Result<(), Error> {
    rules.ensure_initialized(image, runner, env)?;

    let argv = rules.inject_for_exec(image, argv)?;

    info!(image = %image.display(), command = ?argv, "running");
    run_checked(runner, image, &argv, env)
}

/// Run `argv` and fail if it does not exit successfully.
pub(crate) fn run_checked(
    runner: &dyn ImageRunner,
    image: &Path,
    argv: &[String],
    env: &Environment,
) -> Result<(), Error> {
    let failure = match runner.run(image, argv, env) {
        Ok(status) if status.success() => return Ok(()),
        Ok(status) => ExecFailure::Status(status),
        Err(e) => ExecFailure::Launch(e),
    };

    debug!(image = %image.display(), command = ?argv, %failure, "command failed");

    Err(Error::CommandExecution {
        command: argv.join(" "),
        failure,
    })
}


#[test]
fn ch_run_arguments() {
    let command = ChRun::new().program("/opt/ch/bin/ch-run").command(
        Path::new("/var/tmp/img/debian"),
        &["apt-get".to_owned(), "update".to_owned()],
        &[("TERM".to_owned(), "dumb".to_owned())],
    );

    assert_eq!(command.get_program(), "/opt/ch/bin/ch-run");

    let args: Vec<_> = command.get_args().map(|a| a.to_str().unwrap()).collect();
    assert_eq!(
        args,
        [
            "-w",
            "--no-home",
            "--no-passwd",
            "--cd",
            "/",
            "--uid=0",
            "--gid=0",
            "/var/tmp/img/debian",
            "--",
            "apt-get",
            "update"
        ]
    );

    let envs: Vec<_> = command.get_envs().collect();
    assert_eq!(envs.len(), 1);
    assert_eq!(envs[0].0, "TERM");
}

#[test]
fn report_failed_commands() {
    let runner = testing::RecordingRunner::default();
    runner.fail_on(Some("false"));

    let argv = ["/bin/sh".to_owned(), "-c".to_owned(), "false".to_owned()];
    let err = run_checked(&runner, Path::new("/img"), &argv, &[]).unwrap_err();

    match err {
        Error::CommandExecution { command, failure } => {
            assert_eq!(command, "/bin/sh -c false");
            assert!(matches!(failure, ExecFailure::Status(s) if s.code() == Some(1)));
        }
        e => panic!("unexpected error: {e}"),
    }

    assert!(run_checked(&runner, Path::new("/img"), &argv[..2], &[]).is_ok());
}

#[test]
fn report_launch_failures() {
    let runner = testing::RecordingRunner::default();
    runner.fail_launch(true);

    let argv = ["true".to_owned()];
    let err = run_checked(&runner, Path::new("/img"), &argv, &[]).unwrap_err();

    assert!(err.to_string().contains("can't launch"), "{err}");

    match err {
        Error::CommandExecution { command, failure } => {
            assert_eq!(command, "true");
            assert!(matches!(
                failure,
                ExecFailure::Launch(ref e) if e.kind() == io::ErrorKind::NotFound
            ));
        }
        e => panic!("unexpected error: {e}"),
    }

    runner.fail_launch(false);
    assert!(run_checked(&runner, Path::new("/img"), &argv, &[]).is_ok());
    assert_eq!(runner.take_calls().len(), 2);
}

#[test]
fn run_modify_wraps_package_managers() {
    use crate::fakeroot::{image_with, Configuration, Rule, MARKER_PATH};

    let config = Configuration::new("test")
        .first_run(["setup"])
        .sensitive(["apt-get"])
        .prefix(["fakeroot"]);

    let rules = RuleTable::new(vec![Rule::new("/etc/os-release", "^ID=test$", config).unwrap()]);

    let image = image_with(&[("etc/os-release", "ID=test\n")]);
    let runner = testing::RecordingRunner::default();

    let argv = ["apt-get".to_owned(), "update".to_owned()];
    run_modify(&rules, &runner, image.path(), &argv, &[]).unwrap();

    assert_eq!(
        runner.take_calls(),
        [
            vec!["/bin/sh", "-c", "setup"],
            vec!["fakeroot", "apt-get", "update"]
        ]
    );
    assert!(image.path().join(MARKER_PATH).exists());

    // Initialized images only run the command.
    let argv = ["ls".to_owned()];
    run_modify(&rules, &runner, image.path(), &argv, &[]).unwrap();
    assert_eq!(runner.take_calls(), [vec!["ls"]]);

    runner.fail_on(Some("ls"));
    assert!(matches!(
        run_modify(&rules, &runner, image.path(), &argv, &[]),
        Err(Error::CommandExecution { .. })
    ));
}
