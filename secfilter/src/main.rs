//! secfilter-dump: print the PAT and PMTs of a transport stream capture.
//!
//! The capture is pushed through a [`SoftwareDemux`] with one-shot section
//! filters, exactly as a set-top-box client would see it: one PAT filter on
//! PID 0, then one PMT filter per program, recycling filter handles when
//! the session limit is reached.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use clap::Parser;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;

use secfilter::{FilterCallbacks, Session, SessionConfig, SoftwareDemux, StartParams};
use secfilter_protocol::{Comparator, FilterError, FilterFormat, FilterHandle, SectionStatus};
use secfilter_psi::{parse_pat, parse_pmt, pid, table_id, PatTable, PmtTable};

mod logging;

/// Passes over the capture before a PMT that never shows up is given up on.
const MAX_PASSES: usize = 4;

/// secfilter-dump - print PSI tables found through section filters
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Transport stream file to scan
    input: PathBuf,

    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Print tables as JSON
    #[arg(long)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory for rotated log files (console only when unset)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Number of days to keep log files
    #[arg(long)]
    log_retention_days: Option<u64>,

    /// Maximum concurrent section filters
    #[arg(short = 'm', long)]
    max_filters: Option<usize>,

    /// Accept sections whose CRC-32 does not check
    #[arg(long)]
    no_crc: bool,

    /// Report a table as missing after this long without a section
    #[arg(long, default_value = "500")]
    section_timeout_ms: u64,

    /// Bytes handed to the demultiplexer per feed call
    #[arg(long, default_value = "65424")]
    chunk_size: usize,
}

/// Configuration file format.
#[derive(Debug, serde::Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    session: SessionConfig,
    #[serde(default)]
    logging: LoggingSection,
}

#[derive(Debug, serde::Deserialize, Default)]
struct LoggingSection {
    log_dir: Option<String>,
    retention_days: Option<u64>,
    level: Option<String>,
}

fn load_config(path: &Path) -> Result<ConfigFile, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ConfigFile = toml::from_str(&contents)?;
    Ok(config)
}

/// What a filter callback reports back to the scanner.
#[derive(Debug)]
enum TableEvent {
    Section { handle: FilterHandle, data: Bytes },
    Timeout { handle: FilterHandle, at: Instant },
}

impl TableEvent {
    fn handle(&self) -> FilterHandle {
        match self {
            TableEvent::Section { handle, .. } | TableEvent::Timeout { handle, .. } => *handle,
        }
    }
}

#[derive(Debug, Serialize)]
struct PmtReport {
    #[serde(flatten)]
    table: PmtTable,
    audio_languages: BTreeMap<u16, Vec<String>>,
}

#[derive(Debug, Serialize)]
struct DumpReport {
    pat: PatTable,
    pmts: Vec<PmtReport>,
}

struct Scanner {
    session: Session,
    demux: Arc<SoftwareDemux>,
    events_tx: mpsc::UnboundedSender<TableEvent>,
    events: mpsc::UnboundedReceiver<TableEvent>,
    params: StartParams,
    chunk_size: usize,
    event_wait: Duration,
}

impl Scanner {
    fn new(config: SessionConfig, args: &Args) -> Result<Self, FilterError> {
        let session = Session::open(config)?;
        let demux = Arc::new(SoftwareDemux::new(session.event_sender()));
        session.on_demux_ready(demux.clone())?;
        let (events_tx, events) = mpsc::unbounded_channel();
        let timeout = Duration::from_millis(args.section_timeout_ms.max(1));

        Ok(Self {
            session,
            demux,
            events_tx,
            events,
            params: StartParams {
                timeout: Some(timeout),
                one_shot: true,
                enable_crc: !args.no_crc,
            },
            chunk_size: args.chunk_size.max(1),
            event_wait: timeout * 4 + Duration::from_secs(1),
        })
    }

    fn callbacks(&self) -> FilterCallbacks {
        let tx = self.events_tx.clone();
        FilterCallbacks::new(
            |_ctx, _handle, n| Ok(BytesMut::with_capacity(n)),
            move |_ctx, handle, status, section, _n| {
                let event = match status {
                    SectionStatus::Ok => TableEvent::Section {
                        handle,
                        data: section.freeze(),
                    },
                    SectionStatus::Timeout => TableEvent::Timeout {
                        handle,
                        at: Instant::now(),
                    },
                };
                let _ = tx.send(event);
            },
        )
    }

    /// Create, program and start a one-shot section filter.
    fn open_filter(&self, pid: u16, value: &[u8], mask: &[u8]) -> Result<FilterHandle, FilterError> {
        let handle = self
            .session
            .create_filter(pid, FilterFormat::Section, Arc::new(pid))?;
        let started = self
            .session
            .set_filter(handle, value, mask, Comparator::Equal)
            .and_then(|_| self.session.start_filter(handle, self.params, self.callbacks()));
        if let Err(e) = started {
            let _ = self.session.destroy_filter(handle);
            return Err(e);
        }
        Ok(handle)
    }

    /// Feed the whole capture, then wait for one answer per pending filter.
    ///
    /// Timeouts raised while the capture was still being fed are ignored.
    async fn run_pass(&mut self, data: &[u8], pending: &[FilterHandle]) -> Vec<TableEvent> {
        for chunk in data.chunks(self.chunk_size) {
            self.demux.feed(chunk);
            tokio::task::yield_now().await;
        }
        let fed = Instant::now();
        debug!(
            "Fed {} bytes ({} packets, {} sections)",
            data.len(),
            self.demux.packet_count(),
            self.demux.section_count()
        );

        let mut answers: Vec<TableEvent> = Vec::new();
        while answers.len() < pending.len() {
            let event = match tokio::time::timeout(self.event_wait, self.events.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(_) => {
                    warn!("No filter answered within {:?}", self.event_wait);
                    break;
                }
            };
            let handle = event.handle();
            if !pending.contains(&handle) || answers.iter().any(|a| a.handle() == handle) {
                continue;
            }
            if let TableEvent::Timeout { at, .. } = event {
                if at < fed {
                    continue;
                }
            }
            answers.push(event);
        }
        answers
    }

    async fn find_pat(&mut self, data: &[u8]) -> Result<PatTable, Box<dyn std::error::Error>> {
        let handle = self.open_filter(pid::PAT, &[table_id::PAT], &[0xFF])?;
        let answers = self.run_pass(data, &[handle]).await;
        self.session.destroy_filter(handle)?;

        match answers.into_iter().next() {
            Some(TableEvent::Section { data, .. }) => Ok(parse_pat(&data)?),
            _ => Err("no PAT found in capture".into()),
        }
    }

    async fn find_pmts(&mut self, data: &[u8], pat: &PatTable) -> Result<Vec<PmtTable>, Box<dyn std::error::Error>> {
        let mut queue: VecDeque<(u16, u16)> = pat
            .programs()
            .map(|e| (e.program_number, e.program_map_pid))
            .collect();
        let mut tables = Vec::new();

        while !queue.is_empty() {
            // Open as many filters as the session allows
            let mut batch: HashMap<FilterHandle, u16> = HashMap::new();
            while let Some(&(program, pmt_pid)) = queue.front() {
                let [hi, lo] = program.to_be_bytes();
                match self.open_filter(pmt_pid, &[table_id::PMT, hi, lo], &[0xFF, 0xFF, 0xFF]) {
                    Ok(handle) => {
                        batch.insert(handle, program);
                        queue.pop_front();
                    }
                    Err(FilterError::OutOfHandles { max }) if !batch.is_empty() => {
                        debug!("Filter limit {} reached, {} program(s) wait", max, queue.len());
                        break;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            for pass in 1..=MAX_PASSES {
                let pending: Vec<FilterHandle> = batch.keys().copied().collect();
                if pending.is_empty() {
                    break;
                }
                debug!("PMT pass {} for {} filter(s)", pass, pending.len());

                for answer in self.run_pass(data, &pending).await {
                    let handle = answer.handle();
                    let Some(&program) = batch.get(&handle) else {
                        continue;
                    };
                    match answer {
                        TableEvent::Section { data, .. } => match parse_pmt(&data) {
                            Ok(pmt) if pmt.program_number() == program => {
                                tables.push(pmt);
                                batch.remove(&handle);
                                self.session.destroy_filter(handle)?;
                            }
                            Ok(pmt) => {
                                // The demux ignores the low program byte; try again
                                debug!("Got PMT for program {} while waiting for {}", pmt.program_number(), program);
                                self.session.start_filter(handle, self.params, self.callbacks())?;
                            }
                            Err(e) => {
                                warn!("Program {}: undecodable PMT: {}", program, e);
                                batch.remove(&handle);
                                self.session.destroy_filter(handle)?;
                            }
                        },
                        TableEvent::Timeout { .. } => {
                            warn!("Program {}: no PMT found", program);
                            batch.remove(&handle);
                            self.session.destroy_filter(handle)?;
                        }
                    }
                }
            }

            for (handle, program) in batch {
                warn!("Program {}: giving up after {} passes", program, MAX_PASSES);
                self.session.destroy_filter(handle)?;
            }
        }

        Ok(tables)
    }

    fn close(self) {
        let dropped = self.session.dropped_buffers();
        if dropped > 0 {
            warn!("{} section(s) dropped on a full dispatch queue", dropped);
        }
        self.session.close();
    }
}

fn print_text(pat: &PatTable, pmts: &[PmtTable]) {
    println!("{}", pat);
    for pmt in pmts {
        println!();
        println!("{}", pmt);
        for (pid, languages) in pmt.audio_language_index() {
            println!("  audio PID 0x{:04X}: {}", pid, languages.join(", "));
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let file_config = match &args.config {
        Some(path) => load_config(path).map_err(|e| {
            eprintln!("Failed to load config file {}: {}", path.display(), e);
            e
        })?,
        None => ConfigFile::default(),
    };

    // Command line takes precedence over the config file
    let log_dir = args
        .log_dir
        .clone()
        .or_else(|| file_config.logging.log_dir.as_ref().map(PathBuf::from));
    let retention_days = args
        .log_retention_days
        .or(file_config.logging.retention_days)
        .unwrap_or(7);
    logging::init_logging(
        log_dir.as_deref(),
        retention_days,
        args.verbose,
        file_config.logging.level.as_deref(),
    )?;

    let mut session_config = file_config.session.clone();
    if let Some(max_filters) = args.max_filters {
        session_config.max_filters = max_filters;
    }

    let data = tokio::fs::read(&args.input).await?;
    info!("Read {} bytes from {}", data.len(), args.input.display());

    let mut scanner = Scanner::new(session_config, &args)?;
    let result = async {
        let pat = scanner.find_pat(&data).await?;
        let pmts = scanner.find_pmts(&data, &pat).await?;
        Ok::<_, Box<dyn std::error::Error>>((pat, pmts))
    }
    .await;
    scanner.close();
    let (pat, pmts) = result?;

    if args.json {
        let report = DumpReport {
            pmts: pmts
                .into_iter()
                .map(|table| PmtReport {
                    audio_languages: table.audio_language_index(),
                    table,
                })
                .collect(),
            pat,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_text(&pat, &pmts);
    }

    Ok(())
}
