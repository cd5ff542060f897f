//! The terminal progress dashboard.
//!
//! A full-screen view redrawn on a fixed interval from a snapshot of
//! the shared progress state, with per-worker CPU usage sampled on its
//! own interval. The dashboard owns the terminal for the life of the
//! job and restores it after the abort latch releases the render loop.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crossterm::{
    cursor::{Hide, Show},
    execute,
    terminal::{
        disable_raw_mode, enable_raw_mode, EnterAlternateScreen,
        LeaveAlternateScreen,
    },
    tty::IsTty,
};
use kestrel_common::{
    manifest::DashboardConfig, prelude::*, progress::ProgressTracker,
};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    prelude::CrosstermBackend,
    style::{Color, Modifier, Style},
    widgets::{Gauge, List, ListItem, Paragraph},
    Terminal,
};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Everything the dashboard needs from the coordinator.
pub struct Dashboard {
    /// Shared progress state, read snapshot-style.
    pub progress: ProgressTracker,
    /// The job's abort latch; the render loop exits when it is set.
    pub abort: CancellationToken,
    /// Refresh and sampling intervals.
    pub config: DashboardConfig,
    /// Pids of local mapper children, in worker order. Remote mappers
    /// have no local pid and always sample as zero.
    pub mapper_pids: Vec<Option<u32>>,
    /// Pid of the reducer child.
    pub reducer_pid: Option<u32>,
    /// Shown in the footer so the user knows where results will land.
    pub output_path: PathBuf,
}

/// Start the dashboard, or return `None` when stdout is not a
/// terminal.
pub fn spawn(dashboard: Dashboard) -> Option<JoinHandle<()>> {
    if !std::io::stdout().is_tty() {
        debug!("stdout is not a terminal, skipping dashboard");
        return None;
    }
    Some(tokio::spawn(async move {
        if let Err(err) = run(dashboard).await {
            warn!("dashboard failed: {:?}", err);
        }
    }))
}

async fn run(dashboard: Dashboard) -> Result<()> {
    let guard = TerminalGuard::enter(dashboard.abort.clone())?;
    let backend = CrosstermBackend::new(std::io::stdout());
    let mut terminal =
        Terminal::new(backend).context("could not initialize terminal")?;
    let mut sampler =
        CpuSampler::new(&dashboard.mapper_pids, dashboard.reducer_pid);

    let mut redraw = tokio::time::interval(dashboard.config.screen_refresh_interval);
    let mut sample = tokio::time::interval(dashboard.config.cpu_usage_interval);
    let mut cpu = vec![0.0; dashboard.mapper_pids.len() + 1];

    loop {
        tokio::select! {
            _ = dashboard.abort.cancelled() => break,
            _ = sample.tick() => {
                cpu = sampler.sample();
            }
            _ = redraw.tick() => {
                let snapshot = dashboard.progress.snapshot();
                terminal
                    .draw(|frame| draw(frame, &dashboard, &snapshot, &cpu))
                    .context("could not draw dashboard frame")?;
            }
        }
    }

    // The render loop has exited; the guard restores the terminal now.
    drop(guard);
    Ok(())
}

fn draw(
    frame: &mut ratatui::Frame<'_>,
    dashboard: &Dashboard,
    snapshot: &kestrel_common::progress::ProgressSnapshot,
    cpu: &[f32],
) {
    let (header_area, gauge_area, workers_area, messages_area, footer_area) =
        compute_layout(frame.area(), dashboard.mapper_pids.len());

    let header = Paragraph::new(format!(
        "kestrel: {}/{} files, {}/{} bytes, {} failed",
        snapshot.files_processed,
        snapshot.files_total,
        snapshot.bytes_processed,
        snapshot.bytes_total,
        snapshot.files_failed,
    ))
    .style(Style::default().add_modifier(Modifier::BOLD));
    frame.render_widget(header, header_area);

    let ratio = if snapshot.files_total == 0 {
        0.0
    } else {
        (snapshot.files_processed + snapshot.files_failed) as f64
            / snapshot.files_total as f64
    };
    let gauge = Gauge::default()
        .gauge_style(Style::default().fg(Color::Cyan))
        .ratio(ratio.clamp(0.0, 1.0));
    frame.render_widget(gauge, gauge_area);

    let mut rows: Vec<ListItem> = dashboard
        .mapper_pids
        .iter()
        .enumerate()
        .map(|(idx, pid)| {
            let location = match pid {
                Some(pid) => format!("pid {}", pid),
                None => "remote".to_owned(),
            };
            ListItem::new(format!(
                "map {:>3}  {:>5.1}% cpu  ({})",
                idx,
                cpu.get(idx).copied().unwrap_or(0.0),
                location
            ))
        })
        .collect();
    rows.push(ListItem::new(format!(
        "reduce   {:>5.1}% cpu",
        cpu.last().copied().unwrap_or(0.0)
    )));
    frame.render_widget(List::new(rows), workers_area);

    let message_lines: Vec<ListItem> = snapshot
        .messages
        .iter()
        .rev()
        .take(messages_area.height as usize)
        .rev()
        .map(|message| {
            ListItem::new(message.clone())
                .style(Style::default().fg(Color::DarkGray))
        })
        .collect();
    frame.render_widget(List::new(message_lines), messages_area);

    let footer = Paragraph::new(format!(
        "last: {}   results: {}",
        snapshot.last_file_processed,
        dashboard.output_path.display()
    ))
    .style(Style::default().fg(Color::DarkGray));
    frame.render_widget(footer, footer_area);
}

fn compute_layout(area: Rect, workers: usize) -> (Rect, Rect, Rect, Rect, Rect) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Length(1),
            Constraint::Length(workers as u16 + 1),
            Constraint::Min(1),
            Constraint::Length(1),
        ])
        .split(area);
    (rows[0], rows[1], rows[2], rows[3], rows[4])
}

/// Samples CPU usage for the job's local children.
///
/// A process that has exited, or that the sampler cannot read, reports
/// zero rather than failing the dashboard.
struct CpuSampler {
    system: System,
    mapper_pids: Vec<Option<Pid>>,
    reducer_pid: Option<Pid>,
}

impl CpuSampler {
    fn new(mapper_pids: &[Option<u32>], reducer_pid: Option<u32>) -> CpuSampler {
        CpuSampler {
            system: System::new(),
            mapper_pids: mapper_pids
                .iter()
                .map(|pid| pid.map(Pid::from_u32))
                .collect(),
            reducer_pid: reducer_pid.map(Pid::from_u32),
        }
    }

    /// One CPU reading per mapper, with the reducer's last.
    fn sample(&mut self) -> Vec<f32> {
        let mut watched: Vec<Pid> = self.mapper_pids.iter().flatten().copied().collect();
        watched.extend(self.reducer_pid);
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&watched), true);

        let mut readings: Vec<f32> = self
            .mapper_pids
            .iter()
            .map(|pid| self.cpu_usage(*pid))
            .collect();
        readings.push(self.cpu_usage(self.reducer_pid));
        readings
    }

    fn cpu_usage(&self, pid: Option<Pid>) -> f32 {
        pid.and_then(|pid| self.system.process(pid))
            .map(|process| process.cpu_usage())
            .unwrap_or(0.0)
    }
}

/// Puts the terminal into the alternate screen for the life of the
/// dashboard and restores it on drop, even if rendering fails.
///
/// While the terminal is raw, ctrl-c arrives as a key event instead of
/// a signal, so a small input thread forwards it to the abort latch.
struct TerminalGuard {
    stop: Arc<AtomicBool>,
    input_thread: Option<std::thread::JoinHandle<()>>,
}

impl TerminalGuard {
    fn enter(abort: CancellationToken) -> Result<TerminalGuard> {
        enable_raw_mode().context("could not enable raw terminal mode")?;
        execute!(std::io::stdout(), EnterAlternateScreen, Hide)
            .context("could not enter alternate screen")?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = stop.clone();
        let input_thread = std::thread::spawn(move || {
            use crossterm::event::{Event, KeyCode, KeyModifiers};

            while !stop_thread.load(Ordering::Relaxed) {
                if !crossterm::event::poll(Duration::from_millis(200)).unwrap_or(false)
                {
                    continue;
                }
                let Ok(event) = crossterm::event::read() else {
                    continue;
                };
                if let Event::Key(key) = event {
                    if key.code == KeyCode::Char('c')
                        && key.modifiers.contains(KeyModifiers::CONTROL)
                    {
                        abort.cancel();
                    }
                }
            }
        });

        Ok(TerminalGuard {
            stop,
            input_thread: Some(input_thread),
        })
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = execute!(std::io::stdout(), Show, LeaveAlternateScreen);
        let _ = disable_raw_mode();
        if let Some(thread) = self.input_thread.take() {
            let _ = thread.join();
        }
    }
}
