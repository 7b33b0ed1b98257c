use std::collections::HashMap;
use std::future::Future;
use std::io::Write as _;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::errors::{ClientError, Result};
use crate::units::human_size;

const REFRESH_INTERVAL: Duration = Duration::from_millis(100);
/// Long names scroll at one third of the refresh rate.
const NAME_SCROLL_DIVISOR: u64 = 3;

/// Renders one terminal line per concurrent transfer, redrawing in place
/// with CSI cursor movement. All mutation sets a dirty flag; a single
/// writer loop flushes at most every 100ms.
pub struct MultiBar {
    shared: Arc<Shared>,
    tasks: JoinSet<Result<()>>,
    limit: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    renderer: tokio::task::JoinHandle<()>,
}

struct Shared {
    bars: Mutex<Vec<Arc<Mutex<BarState>>>>,
    dirty: AtomicBool,
    width: usize,
    name_width: usize,
}

#[derive(Default)]
struct BarState {
    name: String,
    status: String,
    total: i64,
    done: bool,
    fragments: HashMap<u64, Fragment>,
    next_fragment: u64,
}

#[derive(Default, Clone, Copy)]
struct Fragment {
    offset: i64,
    processed: i64,
}

impl BarState {
    fn processed(&self) -> i64 {
        self.fragments.values().map(|f| f.processed).sum()
    }
}

#[derive(Clone)]
pub struct Bar {
    state: Arc<Mutex<BarState>>,
    shared: Arc<Shared>,
}

impl Bar {
    fn notify(&self) {
        self.shared.dirty.store(true, Ordering::Relaxed);
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut BarState) -> T) -> T {
        let result = f(&mut self.state.lock().expect("bar lock"));
        self.notify();
        result
    }

    pub fn set_name_status(&self, name: &str, status: &str, done: bool) {
        self.with_state(|state| {
            state.name = name.to_string();
            state.status = status.to_string();
            state.done = done;
        });
    }

    pub fn set_status(&self, status: &str, done: bool) {
        self.with_state(|state| {
            state.status = status.to_string();
            state.done = done;
        });
    }

    pub fn set_total(&self, total: i64) {
        self.with_state(|state| state.total = total);
    }

    fn set_done(&self) {
        self.with_state(|state| state.done = true);
    }

    fn add_fragment(&self, offset: i64) -> u64 {
        self.with_state(|state| {
            let id = state.next_fragment;
            state.next_fragment += 1;
            state.fragments.insert(id, Fragment { offset, processed: 0 });
            id
        })
    }

    /// Forget a fragment, e.g. when the transfer that produced it is
    /// retried with a fresh reader.
    pub fn remove_fragment(&self, id: u64) {
        self.with_state(|state| {
            state.fragments.remove(&id);
        });
    }

    fn advance_fragment(&self, id: u64, n: usize) {
        let mut state = self.state.lock().expect("bar lock");
        if let Some(fragment) = state.fragments.get_mut(&id) {
            fragment.processed += n as i64;
        }
        drop(state);
        self.notify();
    }

    pub fn wrap_reader<R: AsyncRead + Unpin>(
        &self,
        reader: R,
        name: &str,
        total: i64,
        status: &str,
    ) -> ProgressReader<R> {
        self.set_name_status(name, status, false);
        self.set_total(total);
        ProgressReader {
            inner: reader,
            bar: self.clone(),
            fragment: self.add_fragment(0),
        }
    }

    /// Wrap a reader that starts mid-blob, e.g. one multipart range.
    pub fn wrap_reader_at<R: AsyncRead + Unpin>(
        &self,
        reader: R,
        offset: i64,
        status: &str,
    ) -> ProgressReader<R> {
        self.with_state(|state| state.status = status.to_string());
        ProgressReader {
            inner: reader,
            bar: self.clone(),
            fragment: self.add_fragment(offset),
        }
    }

    pub fn wrap_writer<W: AsyncWrite + Unpin>(
        &self,
        writer: W,
        name: &str,
        total: i64,
        status: &str,
    ) -> ProgressWriter<W> {
        self.set_name_status(name, status, false);
        self.set_total(total);
        ProgressWriter {
            inner: writer,
            bar: self.clone(),
            fragment: self.add_fragment(0),
        }
    }

    pub fn wrap_sync_reader<R: std::io::Read>(
        &self,
        reader: R,
        name: &str,
        total: i64,
        status: &str,
    ) -> SyncProgressReader<R> {
        self.set_name_status(name, status, false);
        self.set_total(total);
        SyncProgressReader {
            inner: reader,
            bar: self.clone(),
            fragment: self.add_fragment(0),
        }
    }
}

pub struct ProgressReader<R> {
    inner: R,
    bar: Bar,
    fragment: u64,
}

impl<R> ProgressReader<R> {
    pub fn fragment_id(&self) -> u64 {
        self.fragment
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let n = buf.filled().len() - before;
            if n > 0 {
                this.bar.advance_fragment(this.fragment, n);
            }
        }
        result
    }
}

pub struct ProgressWriter<W> {
    inner: W,
    bar: Bar,
    fragment: u64,
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ProgressWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            if *n > 0 {
                this.bar.advance_fragment(this.fragment, *n);
            }
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

pub struct SyncProgressReader<R> {
    inner: R,
    bar: Bar,
    fragment: u64,
}

impl<R: std::io::Read> std::io::Read for SyncProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.bar.advance_fragment(self.fragment, n);
        }
        Ok(n)
    }
}

impl MultiBar {
    pub fn new(width: usize, name_width: usize, concurrency: usize) -> Self {
        let shared = Arc::new(Shared {
            bars: Mutex::new(Vec::new()),
            dirty: AtomicBool::new(false),
            width,
            name_width,
        });
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let render_shared = shared.clone();
        let renderer = tokio::spawn(async move {
            let mut interval = tokio::time::interval(REFRESH_INTERVAL);
            let mut last_rows = 0usize;
            let mut tick = 0u64;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        tick += 1;
                        if render_shared.dirty.swap(false, Ordering::Relaxed) {
                            last_rows = draw(&render_shared, last_rows, tick);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        draw(&render_shared, last_rows, tick);
                        break;
                    }
                }
            }
        });
        Self {
            shared,
            tasks: JoinSet::new(),
            limit: Arc::new(Semaphore::new(concurrency.max(1))),
            shutdown,
            renderer,
        }
    }

    fn add_bar(&self, name: &str, status: &str) -> Bar {
        let state = Arc::new(Mutex::new(BarState {
            name: name.to_string(),
            status: status.to_string(),
            ..Default::default()
        }));
        self.shared
            .bars
            .lock()
            .expect("bars lock")
            .push(state.clone());
        self.shared.dirty.store(true, Ordering::Relaxed);
        Bar {
            state,
            shared: self.shared.clone(),
        }
    }

    /// Spawn `f(bar)` under the concurrency cap. A failing task marks its
    /// bar failed; the first error cancels every other task in [wait].
    pub fn go<F, Fut>(&mut self, name: &str, status: &str, f: F)
    where
        F: FnOnce(Bar) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let bar = self.add_bar(name, status);
        let limit = self.limit.clone();
        self.tasks.spawn(async move {
            let _permit = limit
                .acquire_owned()
                .await
                .map_err(|e| ClientError::Task(e.to_string()))?;
            match f(bar.clone()).await {
                Ok(()) => {
                    bar.set_done();
                    Ok(())
                }
                Err(e) => {
                    bar.set_status("failed", true);
                    Err(e)
                }
            }
        });
    }

    /// Wait for every spawned task. The first failure aborts the rest and
    /// is returned after the group drains.
    pub async fn wait(self) -> Result<()> {
        let MultiBar {
            shared: _shared,
            mut tasks,
            limit: _limit,
            shutdown,
            renderer,
        } = self;
        let mut result: Result<()> = Ok(());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if result.is_ok() {
                        result = Err(e);
                    }
                    tasks.abort_all();
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    if result.is_ok() {
                        result = Err(e.into());
                    }
                    tasks.abort_all();
                }
            }
        }
        let _ = shutdown.send(true);
        let _ = renderer.await;
        result
    }
}

fn draw(shared: &Shared, last_rows: usize, tick: u64) -> usize {
    let bars = shared.bars.lock().expect("bars lock");
    let mut buf = String::new();
    if last_rows > 0 {
        buf.push_str(&format!("\x1b[{last_rows}A\x1b[J"));
    }
    for state in bars.iter() {
        let state = state.lock().expect("bar lock");
        render_line(&mut buf, &state, shared.width, shared.name_width, tick);
    }
    let mut out = std::io::stdout().lock();
    let _ = out.write_all(buf.as_bytes());
    let _ = out.flush();
    bars.len()
}

fn render_line(buf: &mut String, state: &BarState, width: usize, name_width: usize, tick: u64) {
    let cells = render_cells(state, width, tick);
    let name = scrolled_name(&state.name, name_width, tick);
    let processed = state.processed();
    let status = if state.done {
        state.status.clone()
    } else if state.total > 0 && processed > 0 {
        format!(
            "{}/{}",
            human_size(processed as f64),
            human_size(state.total as f64)
        )
    } else {
        state.status.clone()
    };
    buf.push_str(&format!("{name:<name_width$} [{cells}] {status}\n"));
}

fn render_cells(state: &BarState, width: usize, tick: u64) -> String {
    if state.done {
        return "+".repeat(width);
    }
    if state.total <= 0 {
        // indeterminate: one + walks across the bar
        let position = tick as usize % width.max(1);
        return (0..width)
            .map(|i| if i == position { '+' } else { '-' })
            .collect();
    }
    let mut cells = vec!['-'; width];
    for fragment in state.fragments.values() {
        let start = (fragment.offset * width as i64 / state.total).clamp(0, width as i64) as usize;
        let end = ((fragment.offset + fragment.processed) * width as i64 / state.total)
            .clamp(0, width as i64) as usize;
        for cell in cells.iter_mut().take(end).skip(start) {
            *cell = '+';
        }
    }
    cells.into_iter().collect()
}

fn scrolled_name(name: &str, name_width: usize, tick: u64) -> String {
    let chars: Vec<char> = name.chars().collect();
    if chars.len() <= name_width {
        return name.to_string();
    }
    let offset = (tick / NAME_SCROLL_DIVISOR) as usize % chars.len();
    chars
        .iter()
        .cycle()
        .skip(offset)
        .take(name_width)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn bare_bar() -> Bar {
        let shared = Arc::new(Shared {
            bars: Mutex::new(Vec::new()),
            dirty: AtomicBool::new(false),
            width: 10,
            name_width: 8,
        });
        Bar {
            state: Arc::new(Mutex::new(BarState::default())),
            shared,
        }
    }

    #[tokio::test]
    async fn test_progress_reader_counts_bytes() {
        let bar = bare_bar();
        let data = vec![7u8; 1000];
        let mut reader = bar.wrap_reader(data.as_slice(), "blob", 1000, "downloading");
        let mut sink = Vec::new();
        reader.read_to_end(&mut sink).await.unwrap();
        assert_eq!(sink.len(), 1000);
        assert_eq!(bar.state.lock().unwrap().processed(), 1000);
    }

    #[test]
    fn test_fragments_render_independent_ranges() {
        let bar = bare_bar();
        let first = bar.add_fragment(0);
        let second = bar.add_fragment(500);
        bar.set_total(1000);
        bar.advance_fragment(first, 250);
        bar.advance_fragment(second, 500);

        let state = bar.state.lock().unwrap();
        let cells = render_cells(&state, 10, 0);
        // first fragment covers cells 0..2, second 5..10
        assert_eq!(cells, "++---+++++");
    }

    #[test]
    fn test_removed_fragment_stops_counting() {
        let bar = bare_bar();
        let id = bar.add_fragment(0);
        bar.advance_fragment(id, 100);
        bar.remove_fragment(id);
        assert_eq!(bar.state.lock().unwrap().processed(), 0);
    }

    #[test]
    fn test_indeterminate_rotates() {
        let state = BarState {
            total: -1,
            ..Default::default()
        };
        let a = render_cells(&state, 10, 1);
        let b = render_cells(&state, 10, 2);
        assert_ne!(a, b);
        assert_eq!(a.matches('+').count(), 1);
    }

    #[test]
    fn test_done_fills_bar() {
        let state = BarState {
            total: 100,
            done: true,
            ..Default::default()
        };
        assert_eq!(render_cells(&state, 10, 0), "++++++++++");
    }

    #[test]
    fn test_long_names_scroll() {
        let name = "a-very-long-descriptor-name";
        let at_zero = scrolled_name(name, 8, 0);
        let later = scrolled_name(name, 8, 9);
        assert_eq!(at_zero.chars().count(), 8);
        assert_ne!(at_zero, later);
        assert_eq!(scrolled_name("short", 8, 99), "short");
    }

    #[tokio::test]
    async fn test_go_runs_under_cap_and_collects_errors() {
        let mut mb = MultiBar::new(10, 8, 2);
        for i in 0..4 {
            mb.go(&format!("task-{i}"), "pending", move |_bar| async move { Ok(()) });
        }
        mb.go("boom", "pending", |_bar| async {
            Err(ClientError::Other("boom".into()))
        });
        let err = mb.wait().await.unwrap_err();
        assert!(err.to_string().contains("boom"));

        let mut mb = MultiBar::new(10, 8, 3);
        mb.go("fine", "pending", |_bar| async { Ok(()) });
        mb.wait().await.unwrap();
    }
}
