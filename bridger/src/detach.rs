use std::{
    env, io,
    process::{Child, Command, Stdio},
};

pub const DEFAULT_LISTEN_PORT: u16 = 5432;

pub const DEFAULT_UPSTREAM_PORT: u16 = 5433;

/// Re-runs this executable in the background, relaying `listen_port` to
/// `upstream_port`. The child is not attached to our stdio or our process
/// group, so it outlives us.
pub fn spawn_detached(listen_port: u16, upstream_port: u16) -> io::Result<Child> {
    let mut command = Command::new(env::current_exe()?);

    command
        .args(detached_args(listen_port, upstream_port))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;

        command.process_group(0);
    }

    command.spawn()
}

fn detached_args(listen_port: u16, upstream_port: u16) -> [String; 2] {
    [listen_port.to_string(), upstream_port.to_string()]
}
