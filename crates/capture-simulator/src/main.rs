//! Desktop simulator for the signed sample-capture pipeline.
//!
//! Runs capture-core against RAM-emulated flash and a synthetic PDM
//! microphone, so both session modes can be exercised without hardware.
//!
//! ```text
//! capture-simulator record --length-ms 1000 --key secret --output log.cbor
//! capture-simulator infer --windows 10 --window-samples 4000
//! capture-simulator info
//! ```

use std::f32::consts::TAU;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use log::{error, info, warn};

use capture_core::config::CONFIG_SIZE;
use capture_core::session::SensorDescriptor;
use capture_core::signature::verify_log;
use capture_core::storage::{RAM_BLOCK_SIZE, RAM_ERASE_TIME_MS, RAM_N_BLOCKS};
use capture_core::{
    AcquisitionPipeline, BlockStore, CaptureError, DMA_BATCH_SAMPLES, DeviceConfig,
    DeviceIdentity, HmacSha256Signer, InferenceSession, MemoryRegion, RamFlash, SampleProducer,
    SampleSession, SamplingRequest, Sample, SharedBlockStore,
};

/// MAC the simulated device reports
const SIM_MAC: [u8; 6] = [0xe0, 0x5a, 0x1b, 0x7c, 0x42, 0x07];

/// The PDM peripheral's only rate
const PDM_RATE_HZ: u32 = 16_000;

/// Time one DMA batch takes to fill at the PDM rate
const BATCH_PERIOD: Duration =
    Duration::from_micros(DMA_BATCH_SAMPLES as u64 * 1_000_000 / PDM_RATE_HZ as u64);

#[derive(Parser)]
#[command(name = "capture-simulator")]
#[command(about = "Drive the capture pipeline against RAM flash and a synthetic microphone", long_about = None)]
struct Cli {
    /// Refuse writes to unerased flash instead of overwriting
    #[arg(long, global = true)]
    strict: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record one signed capture into RAM flash
    Record {
        /// Capture length in milliseconds
        #[arg(long, default_value = "1000")]
        length_ms: u32,

        /// Sample interval in milliseconds (0.0625 = 16 kHz)
        #[arg(long, default_value = "0.0625")]
        interval_ms: f32,

        /// HMAC key stored in the device config before recording
        #[arg(long)]
        key: Option<String>,

        /// Label stored in the device config
        #[arg(long)]
        label: Option<String>,

        /// Tone frequency of the synthetic microphone in Hz
        #[arg(long, default_value = "440")]
        tone_hz: f32,

        /// Write the signed log (header + payload) to this file
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Stream windows to a stand-in classifier
    Infer {
        /// Number of windows to consume before stopping
        #[arg(long, default_value = "10")]
        windows: u32,

        /// Samples per window
        #[arg(long, default_value = "4000")]
        window_samples: usize,

        /// Extra time the consumer spends per window, to provoke overruns
        #[arg(long, default_value = "0")]
        work_ms: u64,

        /// Tone frequency of the synthetic microphone in Hz
        #[arg(long, default_value = "440")]
        tone_hz: f32,
    },

    /// Show device config and storage capacity
    Info,
}

/// Sine tone with the PDM driver's 2-bit gain applied
struct ToneGenerator {
    phase: f32,
    step: f32,
}

impl ToneGenerator {
    fn new(tone_hz: f32) -> Self {
        Self {
            phase: 0.0,
            step: TAU * tone_hz / PDM_RATE_HZ as f32,
        }
    }

    fn fill(&mut self, buf: &mut [Sample]) {
        for sample in buf {
            let raw = (self.phase.sin() * 2000.0) as Sample;
            *sample = raw << 2;
            self.phase = (self.phase + self.step) % TAU;
        }
    }
}

/// Foreground-polled microphone: every `read_batch` yields one DMA batch
struct PdmMicrophone {
    running: bool,
    tone: ToneGenerator,
}

impl PdmMicrophone {
    fn new(tone_hz: f32) -> Self {
        Self {
            running: false,
            tone: ToneGenerator::new(tone_hz),
        }
    }
}

impl SampleProducer for PdmMicrophone {
    fn sample_rate_hz(&self) -> u32 {
        PDM_RATE_HZ
    }

    fn start(&mut self) -> capture_core::Result<()> {
        self.running = true;
        info!("PDM started at {} Hz", PDM_RATE_HZ);
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
        info!("PDM stopped");
    }

    fn read_batch(&mut self, buf: &mut [Sample]) -> usize {
        if !self.running {
            return 0;
        }
        let n = buf.len().min(DMA_BATCH_SAMPLES);
        self.tone.fill(&mut buf[..n]);
        n
    }
}

/// Microphone whose batches arrive from a timer thread standing in for the
/// DMA-complete interrupt. `read_batch` never yields anything.
struct InterruptMicrophone {
    running: Arc<AtomicBool>,
}

impl SampleProducer for InterruptMicrophone {
    fn sample_rate_hz(&self) -> u32 {
        PDM_RATE_HZ
    }

    fn start(&mut self) -> capture_core::Result<()> {
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
    }

    fn read_batch(&mut self, _buf: &mut [Sample]) -> usize {
        0
    }
}

fn ram_store(strict: bool) -> BlockStore<RamFlash> {
    let region = MemoryRegion::new(
        0,
        RAM_BLOCK_SIZE,
        RAM_N_BLOCKS,
        CONFIG_SIZE as u32,
        RAM_ERASE_TIME_MS,
    );
    let flash = if strict {
        RamFlash::strict(RAM_BLOCK_SIZE, RAM_N_BLOCKS)
    } else {
        RamFlash::new(RAM_BLOCK_SIZE, RAM_N_BLOCKS)
    };
    BlockStore::new(flash, region)
}

fn record(
    mut store: BlockStore<RamFlash>,
    request: SamplingRequest,
    key: Option<String>,
    label: Option<String>,
    tone_hz: f32,
    output: Option<PathBuf>,
) -> capture_core::Result<()> {
    let mut config = DeviceConfig::load_or_init(&mut store, SIM_MAC)?;
    if let Some(key) = key {
        config.set_hmac_key(&key);
    }
    if let Some(label) = label {
        config.set_label(&label);
    }
    config.save(&mut store)?;
    if config.hmac_key().is_empty() {
        warn!("No HMAC key configured, signing with an empty key");
    }

    let store = SharedBlockStore::new(store);
    let pipeline: AcquisitionPipeline<'_, RamFlash> = AcquisitionPipeline::new();
    let mut mic = PdmMicrophone::new(tone_hz);

    let started = Instant::now();
    let report = SampleSession::new(&store, &pipeline).record(&config, &request, &mut mic)?;
    info!(
        "Captured {} samples ({} ms of audio) in {:?}",
        report.samples,
        report.capture_ms,
        started.elapsed()
    );
    info!(
        "Header {} bytes, payload {} bytes, {} bytes total",
        report.header_len, report.payload_bytes, report.total_bytes
    );
    info!("Label: {}", config.sample_label);
    info!("Signature: {}", report.digest_str());

    let (verified, log_bytes) = store.with(|s| {
        let verified = verify_log::<_, HmacSha256Signer>(
            s,
            config.hmac_key().as_bytes(),
            report.signature_index,
            report.total_bytes,
        )?;
        let mut bytes = vec![0u8; report.total_bytes as usize];
        s.read_sample_exact(0, &mut bytes)?;
        Ok::<_, CaptureError>((verified, bytes))
    })?;
    if verified {
        info!("Signature verified");
    } else {
        error!("Signature mismatch");
    }
    let violations = store.with(|s| s.medium().violations());
    if violations > 0 {
        warn!("{} writes hit unerased flash", violations);
    }

    if let Some(path) = output {
        match std::fs::write(&path, &log_bytes) {
            Ok(()) => info!("Wrote {} bytes to {}", log_bytes.len(), path.display()),
            Err(e) => error!("Failed to write {}: {}", path.display(), e),
        }
    }
    Ok(())
}

fn infer(windows: u32, window_samples: usize, work_ms: u64, tone_hz: f32) -> capture_core::Result<()> {
    let pipeline: AcquisitionPipeline<'_, RamFlash> = AcquisitionPipeline::new();
    let running = Arc::new(AtomicBool::new(false));
    let done = AtomicBool::new(false);
    let mut mic = InterruptMicrophone {
        running: running.clone(),
    };

    thread::scope(|scope| {
        let pipeline = &pipeline;
        let done = &done;

        // Timer interrupt: one DMA batch per batch period while running
        scope.spawn(move || {
            let mut tone = ToneGenerator::new(tone_hz);
            let mut dma = [0 as Sample; DMA_BATCH_SAMPLES];
            while !done.load(Ordering::Acquire) {
                if running.load(Ordering::Acquire) {
                    tone.fill(&mut dma);
                    pipeline.deliver(&dma);
                }
                thread::sleep(BATCH_PERIOD);
            }
        });

        let result = consume(pipeline, &mut mic, windows, window_samples, work_ms);
        done.store(true, Ordering::Release);
        result
    })
}

fn consume(
    pipeline: &AcquisitionPipeline<'_, RamFlash>,
    mic: &mut InterruptMicrophone,
    windows: u32,
    window_samples: usize,
    work_ms: u64,
) -> capture_core::Result<()> {
    let session = InferenceSession::start(pipeline, mic, window_samples, 1000.0 / PDM_RATE_HZ as f32)?;
    let mut features = vec![0.0f32; window_samples];
    let mut seen = 0;
    let mut overruns = 0;

    while seen < windows {
        match session.poll_window() {
            Ok(false) => {
                thread::sleep(Duration::from_millis(1));
                continue;
            }
            Ok(true) => {}
            Err(CaptureError::BufferOverrun { missed }) => overruns += missed,
            Err(e) => {
                session.stop(mic);
                return Err(e);
            }
        }

        let n = session.read_window(0, &mut features);
        let rms = (features[..n].iter().map(|s| s * s).sum::<f32>() / n.max(1) as f32).sqrt();
        info!("Window {}: {} samples, rms {:.1}", seen, n, rms);
        seen += 1;
        thread::sleep(Duration::from_millis(work_ms));
    }

    session.stop(mic);
    info!("Consumed {} windows, {} overrun(s)", seen, overruns);
    Ok(())
}

fn show_info(mut store: BlockStore<RamFlash>) -> capture_core::Result<()> {
    let config = DeviceConfig::load_or_init(&mut store, SIM_MAC)?;
    info!("Device id: {}", config.device_id());
    info!("Device type: {}", config.device_type());
    info!(
        "Sampling: {} ms every {} ms, label {}",
        config.sample_length_ms, config.sample_interval_ms, config.sample_label
    );

    let mic = SensorDescriptor::microphone(&store);
    info!(
        "Storage: {} sample blocks ({} bytes) of {} bytes",
        store.available_sample_blocks(),
        store.available_sample_bytes(),
        store.block_size()
    );
    info!(
        "Sensor {}: up to {} s at {:?} Hz",
        mic.name, mic.max_sample_length_s, mic.frequencies
    );
    Ok(())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    info!("Starting capture simulator");
    info!(
        "RAM flash: {} blocks of {} bytes{}",
        RAM_N_BLOCKS,
        RAM_BLOCK_SIZE,
        if cli.strict { " (strict)" } else { "" }
    );

    let store = ram_store(cli.strict);
    let result = match cli.command {
        Commands::Record {
            length_ms,
            interval_ms,
            key,
            label,
            tone_hz,
            output,
        } => record(
            store,
            SamplingRequest {
                length_ms,
                interval_ms,
            },
            key,
            label,
            tone_hz,
            output,
        ),
        Commands::Infer {
            windows,
            window_samples,
            work_ms,
            tone_hz,
        } => infer(windows, window_samples, work_ms, tone_hz),
        Commands::Info => show_info(store),
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}
