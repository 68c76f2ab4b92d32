//! An in-process stand-in for GDB.
//!
//! The fake speaks just enough MI over `tokio::io::duplex` pipes to drive
//! the controller through startup, commands and shutdown, and keeps a
//! journal of everything the controller asked of it.

#![allow(dead_code)]

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gdbcontrol::process::{ProcessReader, ProcessWriter};
use gdbcontrol::{
    ControlEvent, DebuggerProcess, DebuggerSession, GdbControl, ProcessSpawner, SessionConfig,
    SessionKind,
};
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QuitBehavior {
    /// Answer `^exit` and go away with status 0
    Exit,
    /// Never answer
    Hang,
    /// Answer `^error` after the delay
    FailAfter(Duration),
}

#[derive(Debug, Clone)]
pub struct FakeSettings {
    pub banner: Vec<String>,
    pub print_prompt: bool,
    pub console_probe_ok: bool,
    pub features: Vec<String>,
    pub quit: QuitBehavior,
    pub supports_interrupt: bool,
    pub fail_spawn: bool,
    /// Exit with this code on the first command, closing the pipes a little later
    pub die_on_first_command: Option<i32>,
}

impl Default for FakeSettings {
    fn default() -> Self {
        Self {
            banner: vec!["GNU gdb (Fake) 13.2".into(), "For help, type \"help\".".into()],
            print_prompt: true,
            console_probe_ok: true,
            features: vec!["python".into(), "thread-info".into()],
            quit: QuitBehavior::Exit,
            supports_interrupt: true,
            fail_spawn: false,
            die_on_first_command: None,
        }
    }
}

#[derive(Default)]
struct FakeShared {
    journal: Mutex<Vec<String>>,
    exit: Mutex<Option<i32>>,
    script: Mutex<Option<JoinHandle<()>>>,
    inject: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl FakeShared {
    fn log(&self, entry: impl Into<String>) {
        self.journal.lock().unwrap().push(entry.into());
    }

    fn exit_with(&self, code: i32) {
        self.exit.lock().unwrap().get_or_insert(code);
    }

    fn stop_script(&self) {
        if let Some(script) = self.script.lock().unwrap().take() {
            script.abort();
        }
    }
}

pub struct FakeSpawner {
    settings: FakeSettings,
    shared: Arc<FakeShared>,
}

/// The test's view of the fake process.
#[derive(Clone)]
pub struct FakeGdb {
    shared: Arc<FakeShared>,
    inject: mpsc::UnboundedSender<String>,
}

impl FakeSpawner {
    pub fn new(settings: FakeSettings) -> (Arc<Self>, FakeGdb) {
        let (inject, injected) = mpsc::unbounded_channel();
        let shared = Arc::new(FakeShared::default());
        *shared.inject.lock().unwrap() = Some(injected);
        (
            Arc::new(Self {
                settings,
                shared: shared.clone(),
            }),
            FakeGdb { shared, inject },
        )
    }
}

impl ProcessSpawner for FakeSpawner {
    fn spawn(&self, command_line: &[String]) -> io::Result<Box<dyn DebuggerProcess>> {
        self.shared.log(format!("spawn:{}", command_line.join(" ")));
        if self.settings.fail_spawn {
            return Err(io::Error::new(io::ErrorKind::NotFound, "fake gdb not found"));
        }

        let (stdin, gdb_in) = duplex(64 * 1024);
        let (gdb_out, stdout) = duplex(64 * 1024);
        let injected = self
            .shared
            .inject
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| mpsc::unbounded_channel().1);

        let script = tokio::spawn(run_script(
            self.settings.clone(),
            self.shared.clone(),
            BufReader::new(gdb_in),
            gdb_out,
            injected,
        ));
        *self.shared.script.lock().unwrap() = Some(script);

        Ok(Box::new(FakeProcess {
            shared: self.shared.clone(),
            stdin: Some(Box::new(stdin)),
            stdout: Some(Box::new(stdout)),
            supports_interrupt: self.settings.supports_interrupt,
        }))
    }
}

struct FakeProcess {
    shared: Arc<FakeShared>,
    stdin: Option<ProcessWriter>,
    stdout: Option<ProcessReader>,
    supports_interrupt: bool,
}

impl DebuggerProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        Some(4242)
    }

    fn take_stdin(&mut self) -> Option<ProcessWriter> {
        self.stdin.take()
    }

    fn take_stdout(&mut self) -> Option<ProcessReader> {
        self.stdout.take()
    }

    fn try_exit_code(&mut self) -> io::Result<Option<i32>> {
        Ok(*self.shared.exit.lock().unwrap())
    }

    fn destroy(&mut self) -> io::Result<()> {
        self.shared.log("destroy");
        self.shared.exit_with(137);
        self.shared.stop_script();
        Ok(())
    }

    fn supports_interrupt(&self) -> bool {
        self.supports_interrupt
    }

    fn interrupt(&mut self) -> io::Result<()> {
        self.shared.log("interrupt");
        Ok(())
    }
}

async fn run_script(
    settings: FakeSettings,
    shared: Arc<FakeShared>,
    commands: BufReader<DuplexStream>,
    mut out: DuplexStream,
    mut injected: mpsc::UnboundedReceiver<String>,
) {
    let mut banner = settings.banner.join("\n");
    banner.push('\n');
    if settings.print_prompt {
        banner.push_str("(gdb) \n");
    }
    if out.write_all(banner.as_bytes()).await.is_err() {
        return;
    }

    let mut commands = commands.lines();
    loop {
        tokio::select! {
            line = commands.next_line() => {
                let Ok(Some(line)) = line else { break };
                let split = line.find(|c: char| !c.is_ascii_digit()).unwrap_or(line.len());
                let (token, command) = line.split_at(split);
                shared.log(format!("cmd:{command}"));
                if let Some(code) = settings.die_on_first_command {
                    shared.exit_with(code);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    return;
                }

                let reply = match command {
                    "-interpreter-exec console \"echo\"" if !settings.console_probe_ok => {
                        format!("{token}^error,msg=\"Undefined MI command: interpreter-exec\"\n")
                    }
                    "-list-features" => {
                        let features: Vec<String> =
                            settings.features.iter().map(|f| format!("\"{f}\"")).collect();
                        format!("{token}^done,features=[{}]\n", features.join(","))
                    }
                    "-exec-run" | "-exec-continue" => {
                        format!("{token}^running\n*running,thread-id=\"all\"\n")
                    }
                    "-gdb-exit" => match settings.quit {
                        QuitBehavior::Exit => {
                            let _ = out.write_all(format!("{token}^exit\n").as_bytes()).await;
                            shared.exit_with(0);
                            return;
                        }
                        QuitBehavior::Hang => continue,
                        QuitBehavior::FailAfter(delay) => {
                            tokio::time::sleep(delay).await;
                            format!("{token}^error,msg=\"Cannot quit now\"\n")
                        }
                    },
                    _ => format!("{token}^done\n"),
                };
                if out.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
                let _ = out.write_all(b"(gdb) \n").await;
            }
            Some(line) = injected.recv() => {
                let line = format!("{line}\n");
                if out.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        }
    }
}

impl FakeGdb {
    pub fn journal(&self) -> Vec<String> {
        self.shared.journal.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.journal().iter().filter(|e| *e == entry).count()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.journal().iter().position(|e| e == entry)
    }

    /// Write an unsolicited line to the controller.
    pub fn emit(&self, line: &str) {
        let _ = self.inject.send(line.to_string());
    }

    /// Make the process die on its own with `code`.
    pub fn crash(&self, code: i32) {
        self.shared.exit_with(code);
        self.shared.stop_script();
    }
}

pub fn config(kind: SessionKind) -> SessionConfig {
    SessionConfig {
        launch_timeout_ms: 1_000,
        terminate_grace_ms: 1_000,
        destroy_wait_ms: 1_000,
        exit_poll_ms: 10,
        ..SessionConfig::new(kind, "fake-gdb")
    }
}

pub fn controller(config: SessionConfig, settings: FakeSettings) -> (GdbControl, FakeGdb) {
    let (spawner, fake) = FakeSpawner::new(settings);
    let control = GdbControl::new(DebuggerSession::new("test", config), spawner);
    (control, fake)
}

/// Collects every event the controller raises.
pub fn record_events(control: &GdbControl) -> Arc<Mutex<Vec<ControlEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    control.events().add_listener(move |event| {
        sink.lock().unwrap().push(event.clone());
    });
    events
}

pub fn exited_events(events: &Mutex<Vec<ControlEvent>>) -> Vec<i32> {
    events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|event| match event {
            ControlEvent::Exited { exit_code, .. } => Some(*exit_code),
            ControlEvent::Started(_) => None,
        })
        .collect()
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
