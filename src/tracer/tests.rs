use super::*;
use anyhow::anyhow;
use crate::events::SubscribeError;
use crate::process::ProcessRecord;
use std::collections::{HashMap, VecDeque};

struct FakeProcess {
    record: ProcessRecord,
    argv: Option<Vec<Vec<u8>>>,
    envp: Option<Vec<Vec<u8>>>,
    cwd: Option<Vec<u8>>,
    exe: Option<Vec<u8>>,
}

#[derive(Default)]
struct FakeTable {
    processes: HashMap<Pid, FakeProcess>,
}

fn bytes(words: &[&str]) -> Vec<Vec<u8>> {
    words.iter().map(|w| w.as_bytes().to_vec()).collect()
}

impl FakeTable {
    fn with(mut self, pid: Pid, parent_pid: Pid, argv: &[&str]) -> Self {
        let exe = argv.first().map(|argv0| {
            if argv0.starts_with('/') {
                argv0.as_bytes().to_vec()
            } else {
                format!("/usr/bin/{argv0}").into_bytes()
            }
        });
        self.processes.insert(
            pid,
            FakeProcess {
                record: ProcessRecord {
                    pid,
                    parent_pid,
                    start_time: pid as u64 * 10,
                    is_zombie: false,
                },
                argv: Some(bytes(argv)),
                envp: Some(vec![]),
                cwd: Some(b"/".to_vec()),
                exe,
            },
        );
        self
    }

    fn modify(mut self, pid: Pid, f: impl FnOnce(&mut FakeProcess)) -> Self {
        if let Some(process) = self.processes.get_mut(&pid) {
            f(process);
        }
        self
    }

    fn get<T: Clone>(&self, pid: Pid, field: impl Fn(&FakeProcess) -> &Option<T>) -> Result<T> {
        self.processes
            .get(&pid)
            .and_then(|p| field(p).clone())
            .ok_or_else(|| anyhow!("Process {pid} is gone"))
    }
}

impl ProcessTable for FakeTable {
    fn process(&self, pid: Pid) -> Option<ProcessRecord> {
        self.processes.get(&pid).map(|p| p.record)
    }

    fn argv(&self, pid: Pid) -> Result<Vec<Vec<u8>>> {
        self.get(pid, |p| &p.argv)
    }

    fn envp(&self, pid: Pid) -> Result<Vec<Vec<u8>>> {
        self.get(pid, |p| &p.envp)
    }

    fn cwd(&self, pid: Pid) -> Result<Vec<u8>> {
        self.get(pid, |p| &p.cwd)
    }

    fn exe_path(&self, pid: Pid) -> Result<Vec<u8>> {
        self.get(pid, |p| &p.exe)
    }

    fn list_all(&self) -> Result<Vec<ProcessRecord>> {
        Ok(self.processes.values().map(|p| p.record).collect())
    }
}

/// Replays batches of events, then asks the tracer to stop.
struct ScriptedSource {
    batches: VecDeque<Vec<Event>>,
    exhausted: bool,
    unsubscribed: Vec<Pid>,
}

impl EventSource for ScriptedSource {
    fn next_batch(&mut self) -> Result<Vec<Event>> {
        match self.batches.pop_front() {
            Some(batch) => Ok(batch),
            None => {
                self.exhausted = true;
                Ok(vec![Event::Signal(SignalKind::Interrupt)])
            }
        }
    }

    fn subscribe(&mut self, _pid: Pid) -> Result<(), SubscribeError> {
        Ok(())
    }

    fn unsubscribe(&mut self, pid: Pid) {
        self.unsubscribed.push(pid);
    }
}

struct ScriptedReaper(VecDeque<Reap>);

impl Reaper for ScriptedReaper {
    fn reap(&mut self) -> Result<Reap> {
        Ok(self.0.pop_front().unwrap_or(Reap::NoChildren))
    }
}

type TestTracer = Tracer<ScriptedSource, FakeTable, ScriptedReaper, Vec<u8>>;

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

fn exec(pid: Pid, millis: u64) -> Event {
    Event::Exec {
        pid,
        timestamp: ms(millis),
    }
}

fn exit(pid: Pid, status: ExitStatus, millis: u64) -> Event {
    Event::Exit {
        pid,
        status,
        timestamp: ms(millis),
    }
}

fn display() -> DisplayOptions {
    DisplayOptions::default()
}

fn with_exits() -> DisplayOptions {
    DisplayOptions {
        show_exit: true,
        ..DisplayOptions::default()
    }
}

fn settings(display: DisplayOptions, root: Pid) -> TraceSettings {
    TraceSettings {
        display,
        root,
        adopter: None,
        spawned: None,
        ledger_capacity: 64,
    }
}

fn tracer(
    table: FakeTable,
    batches: Vec<Vec<Event>>,
    reaps: Vec<Reap>,
    settings: TraceSettings,
) -> TestTracer {
    let source = ScriptedSource {
        batches: batches.into(),
        exhausted: false,
        unsubscribed: vec![],
    };
    Tracer::new(
        source,
        table,
        ScriptedReaper(reaps.into()),
        Vec::new(),
        settings,
    )
}

fn run(mut tracer: TestTracer) -> (String, TestTracer) {
    tracer.run().unwrap();
    let output = String::from_utf8(tracer.output.clone()).unwrap();
    (output, tracer)
}

fn system() -> FakeTable {
    FakeTable::default().with(1, 0, &["/sbin/init"])
}

#[rstest::rstest]
#[case::flat(DisplayOptions { flat: true, ..display() }, "500 true\n")]
#[case::indented(display(), "500   true\n")]
#[case::full_path(DisplayOptions { flat: true, full_path: true, ..display() }, "500 /bin/true\n")]
fn test_exec_without_arguments(#[case] display: DisplayOptions, #[case] expected: &str) {
    let table = system()
        .with(500, 1, &["true"])
        .modify(500, |p| p.exe = Some(b"/bin/true".to_vec()));

    let (output, _) = run(tracer(table, vec![vec![exec(500, 0)]], vec![], settings(display, 1)));

    assert_eq!(output, expected);
}

#[test]
fn test_child_is_indented_below_its_parent() {
    let table = system()
        .with(500, 1, &["sh", "-c", "id"])
        .with(501, 500, &["/usr/bin/id"]);
    let batches = vec![vec![exec(500, 0)], vec![exec(501, 5)]];

    let (output, _) = run(tracer(table, batches, vec![], settings(display(), 500)));

    assert_eq!(output, "500 sh -c id\n501   /usr/bin/id\n");
}

#[test]
fn test_processes_outside_the_subtree_are_ignored() {
    let table = system()
        .with(500, 1, &["bash"])
        .with(700, 1, &["cron"])
        .with(701, 700, &["backup.sh"]);
    let batches = vec![vec![
        exec(700, 0),
        exec(701, 1),
        exit(701, ExitStatus::Exited(0), 2),
    ]];

    let (output, tracer) = run(tracer(table, batches, vec![], settings(with_exits(), 500)));

    assert_eq!(output, "");
    assert!(tracer.ledger.is_empty());
}

#[test]
fn test_exit_line_reports_status_and_elapsed_time() {
    let table = system().with(502, 1, &["sleep", "1.5"]);
    let batches = vec![vec![exec(502, 10_000)], vec![exit(502, ExitStatus::Exited(0), 11_500)]];

    let (output, tracer) = run(tracer(table, batches, vec![], settings(with_exits(), 1)));

    assert_eq!(
        output,
        "502+   sleep 1.5\n502-   sleep exited status=0 time=1.500s\n"
    );
    assert!(tracer.ledger.is_empty());
    assert_eq!(tracer.source.unsubscribed, vec![502]);
}

#[test]
fn test_exit_line_reports_signal() {
    let table = system().with(503, 1, &["yes"]);
    let batches = vec![vec![
        exec(503, 0),
        exit(503, ExitStatus::Signaled(libc::SIGTERM), 250),
    ]];

    let (output, _) = run(tracer(table, batches, vec![], settings(with_exits(), 1)));

    assert!(output.contains("503-   yes exited signal=SIGTERM time=0.250s\n"));
}

#[test]
fn test_exit_without_exit_reporting_releases_silently() {
    let table = system().with(504, 1, &["ls"]);
    let batches = vec![vec![exec(504, 0), exit(504, ExitStatus::Exited(1), 10)]];

    let (output, tracer) = run(tracer(table, batches, vec![], settings(display(), 1)));

    assert_eq!(output, "504   ls\n");
    assert!(tracer.ledger.is_empty());
}

#[test]
fn test_exit_of_untracked_process_is_ignored() {
    let batches = vec![vec![exit(999, ExitStatus::Exited(0), 0)]];

    let (output, _) = run(tracer(system(), batches, vec![], settings(with_exits(), 1)));

    assert_eq!(output, "");
}

#[test]
fn test_reexec_reports_previous_image() {
    let table = system().with(510, 1, &["ls", "-l"]);
    let mut tracer = tracer(
        table,
        vec![vec![exec(510, 1_250)]],
        vec![],
        settings(with_exits(), 1),
    );
    // 510 was traced as `sh` before, with the same start time
    tracer
        .ledger
        .claim(510, LedgerEntry::new(1, ms(1_000), 5100, b"sh"));

    let (output, tracer) = run(tracer);

    assert_eq!(output, "510-   sh execed time=0.250s\n510+   ls -l\n");
    assert_eq!(tracer.ledger.get(510).unwrap().label, b"ls");
    assert_eq!(tracer.ledger.get(510).unwrap().start, ms(1_250));
}

#[test]
fn test_recycled_pid_replaces_stale_entry_silently() {
    let table = system().with(520, 1, &["date"]);
    let mut tracer = tracer(
        table,
        vec![vec![exec(520, 9_000)]],
        vec![],
        settings(with_exits(), 1),
    );
    // Left over from a process that exited while its events were lost
    tracer
        .ledger
        .claim(520, LedgerEntry::new(3, ms(1_000), 1, b"old"));

    let (output, tracer) = run(tracer);

    assert_eq!(output, "520+   date\n");
    assert_eq!(tracer.ledger.get(520).unwrap().generation, 5200);
    assert_eq!(tracer.ledger.get(520).unwrap().depth, 1);
}

#[test_log::test]
fn test_unreadable_command_line_prints_blank_line() {
    let table = system()
        .with(530, 1, &["gone"])
        .modify(530, |p| p.argv = None);
    let batches = vec![vec![exec(530, 0)], vec![exit(530, ExitStatus::Exited(0), 20)]];

    let (output, _) = run(tracer(
        table,
        batches,
        vec![],
        settings(DisplayOptions { flat: true, ..with_exits() }, 1),
    ));

    assert_eq!(output, "530+ \n530- ? exited status=0 time=0.020s\n");
}

#[test]
fn test_cwd_and_environment() {
    let table = system()
        .with(540, 1, &["make", "-j4"])
        .modify(540, |p| {
            p.cwd = Some(b"/tmp/my dir".to_vec());
            p.envp = Some(bytes(&["HOME=/root", "PS1=$ "]));
        });
    let display = DisplayOptions {
        show_cwd: true,
        show_env: true,
        flat: true,
        ..display()
    };

    let (output, _) = run(tracer(table, vec![vec![exec(540, 0)]], vec![], settings(display, 1)));

    assert_eq!(output, "540 '/tmp/my dir' % make -j4 HOME=/root PS1='$ '\n");
}

#[test]
fn test_unreadable_cwd_and_environment() {
    let table = system().with(541, 1, &["su"]).modify(541, |p| {
        p.cwd = None;
        p.envp = None;
    });
    let display = DisplayOptions {
        show_cwd: true,
        show_env: true,
        flat: true,
        ..display()
    };

    let (output, _) = run(tracer(table, vec![vec![exec(541, 0)]], vec![], settings(display, 1)));

    assert_eq!(output, "541 ? % su -\n");
}

#[test]
fn test_quiet_hides_arguments() {
    let table = system().with(550, 1, &["make", "-j4", "all"]);
    let display = DisplayOptions {
        show_args: false,
        flat: true,
        ..display()
    };

    let (output, _) = run(tracer(table, vec![vec![exec(550, 0)]], vec![], settings(display, 1)));

    assert_eq!(output, "550 make\n");
}

#[test]
fn test_arguments_are_shell_quoted() {
    let table = system().with(560, 1, &["sh", "-c", "echo 'hi'\nexit 1", ""]);
    let display = DisplayOptions {
        flat: true,
        ..display()
    };

    let (output, _) = run(tracer(table, vec![vec![exec(560, 0)]], vec![], settings(display, 1)));

    assert_eq!(output, "560 sh -c 'echo '\\''hi'\\'''$'\\n''exit 1' ''\n");
}

#[test]
fn test_interrupt_stops_between_events() {
    let table = system()
        .with(570, 1, &["a"])
        .with(571, 1, &["b"])
        .with(572, 1, &["c"]);
    let batches = vec![
        vec![exec(570, 0), Event::Signal(SignalKind::Interrupt), exec(571, 1)],
        vec![exec(572, 2)],
    ];

    let (output, tracer) = run(tracer(table, batches, vec![], settings(display(), 1)));

    assert_eq!(output, "570   a\n");
    assert!(!tracer.source.exhausted);
    assert_eq!(tracer.source.batches.len(), 1);
}

#[test]
fn test_spawned_command_ends_trace_once_subtree_is_reaped() {
    // The tracer is 5, the command 600 forks 601 and exits first
    let table = FakeTable::default()
        .with(5, 1, &["extrace"])
        .with(600, 5, &["sh", "-c", "sleep 1 &"])
        .with(601, 600, &["sleep", "1"])
        .with(700, 1, &["unrelated"]);
    let batches = vec![
        vec![exec(600, 0), exec(601, 10)],
        vec![Event::Signal(SignalKind::Child)],
        vec![Event::Signal(SignalKind::Child)],
        vec![exec(700, 1_500)],
    ];
    let reaps = vec![
        Reap::Exited {
            pid: 600,
            status: ExitStatus::Exited(0),
            timestamp: ms(20),
        },
        Reap::StillRunning,
        Reap::Exited {
            pid: 601,
            status: ExitStatus::Exited(0),
            timestamp: ms(1_010),
        },
        Reap::NoChildren,
    ];
    let settings = TraceSettings {
        adopter: Some(5),
        spawned: Some(600),
        ..settings(with_exits(), 600)
    };

    let (output, tracer) = run(tracer(table, batches, reaps, settings));

    insta::assert_snapshot!(output, @r"
    600+ sh -c 'sleep 1 &'
    601+   sleep 1
    600- sh exited status=0 time=0.020s
    601-   sleep exited status=0 time=1.000s
    ");
    assert!(!tracer.source.exhausted);
    assert_eq!(tracer.source.batches.len(), 1);
}

#[test]
fn test_adopted_orphan_keeps_its_depth() {
    // 602 forked by 601, which exited, so 602 now hangs off the tracer
    let table = FakeTable::default()
        .with(5, 1, &["extrace"])
        .with(602, 5, &["cat"]);
    let settings = TraceSettings {
        adopter: Some(5),
        spawned: Some(600),
        ..settings(display(), 600)
    };

    let (output, _) = run(tracer(table, vec![vec![exec(602, 0)]], vec![], settings));

    assert_eq!(output, "602   cat\n");
}

#[test]
fn test_reaping_outside_spawned_mode_keeps_running() {
    let table = system().with(580, 1, &["true"]);
    let batches = vec![vec![exec(580, 0), Event::Signal(SignalKind::Child)]];
    let reaps = vec![Reap::NoChildren];

    let (output, tracer) = run(tracer(table, batches, reaps, settings(display(), 1)));

    assert_eq!(output, "580   true\n");
    assert!(tracer.source.exhausted);
}

#[test]
fn test_process_tree_snapshot() {
    let table = system()
        .with(1000, 1, &["make", "all"])
        .with(1001, 1000, &["cc", "-c", "main.c"])
        .with(1002, 1001, &["/usr/lib/gcc/cc1", "main.c"])
        .with(1003, 1000, &["ld", "-o", "main", "main.o"]);
    let batches = vec![
        vec![exec(1000, 0)],
        vec![exec(1001, 100), exec(1002, 120)],
        vec![
            exit(1002, ExitStatus::Exited(0), 380),
            exit(1001, ExitStatus::Exited(0), 400),
        ],
        vec![exec(1003, 410), exit(1003, ExitStatus::Signaled(libc::SIGKILL), 500)],
        vec![exit(1000, ExitStatus::Exited(2), 1_234)],
    ];

    let (output, _) = run(tracer(table, batches, vec![], settings(with_exits(), 1000)));

    insta::assert_snapshot!(output, @r"
    1000+ make all
    1001+   cc -c main.c
    1002+     /usr/lib/gcc/cc1 main.c
    1002-     cc1 exited status=0 time=0.260s
    1001-   cc exited status=0 time=0.300s
    1003+   ld -o main main.o
    1003-   ld exited signal=SIGKILL time=0.090s
    1000- make exited status=2 time=1.234s
    ");
}

struct ClosedPipe;

impl Write for ClosedPipe {
    fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
        Err(ErrorKind::BrokenPipe.into())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_closed_output_ends_trace() {
    let table = system().with(590, 1, &["ls"]).with(591, 1, &["ls"]);
    let source = ScriptedSource {
        batches: vec![vec![exec(590, 0)], vec![exec(591, 1)]].into(),
        exhausted: false,
        unsubscribed: vec![],
    };
    let mut tracer = Tracer::new(
        source,
        table,
        ScriptedReaper(VecDeque::new()),
        ClosedPipe,
        settings(display(), 1),
    );

    tracer.run().unwrap();

    assert_eq!(tracer.source.batches.len(), 1);
}
