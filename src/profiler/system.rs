//! Probes backed by the live machine: procfs (`sysctl` on macOS),
//! `nvidia-smi`, `nvcc`.

use std::io;
use std::path::Path;
use std::process::Command;

use adaptive_control_models::{AcceleratorInfo, ComputeCapability, DeviceTarget, ToolchainVersion};

use super::{features, ProbeSource};
use crate::errors::ProbeDegradation;

const MEMINFO_PATH: &str = "/proc/meminfo";
const CPUINFO_PATH: &str = "/proc/cpuinfo";

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl ProbeSource for SystemProbe {
    fn cpu_name(&self) -> Result<String, ProbeDegradation> {
        let content = read_proc(CPUINFO_PATH)?;
        parse_cpu_name(&content)
    }

    fn cpu_threads(&self) -> Result<u32, ProbeDegradation> {
        std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .map_err(|e| ProbeDegradation::Unavailable {
                source_name: "available_parallelism",
                detail: e.to_string(),
            })
    }

    fn cpu_cores(&self) -> Result<u32, ProbeDegradation> {
        let content = read_proc(CPUINFO_PATH)?;
        parse_physical_cores(&content)
    }

    fn system_memory_gb(&self) -> Result<f64, ProbeDegradation> {
        if cfg!(target_os = "macos") {
            return match run_tool("sysctl", &["-n", "hw.memsize"])? {
                Some(output) => parse_memsize_gb(&output),
                None => Err(ProbeDegradation::Unavailable {
                    source_name: "sysctl",
                    detail: "sysctl not found".to_string(),
                }),
            };
        }
        let content = read_proc(MEMINFO_PATH)?;
        parse_mem_total_gb(&content)
    }

    fn accelerator(&self) -> Result<Option<AcceleratorInfo>, ProbeDegradation> {
        if cfg!(target_os = "macos") && features::metal_runtime_compiled() {
            let memory_gb = self.system_memory_gb().unwrap_or(0.0);
            return Ok(Some(AcceleratorInfo {
                target: DeviceTarget::Metal,
                name: "apple-gpu".to_string(),
                memory_gb,
                capability: None,
                count: 1,
            }));
        }

        let Some(output) = run_tool(
            "nvidia-smi",
            &[
                "--query-gpu=name,memory.total,compute_cap",
                "--format=csv,noheader,nounits",
            ],
        )?
        else {
            return Ok(None);
        };

        let detected = parse_nvidia_smi(&output)?;
        if detected.is_some() && !features::cuda_runtime_compiled() {
            tracing::info!("cuda device present but this build has no cuda backend; using cpu");
            return Ok(None);
        }
        Ok(detected)
    }

    fn graph_toolchain_version(&self) -> Result<Option<ToolchainVersion>, ProbeDegradation> {
        match run_tool("nvcc", &["--version"])? {
            Some(output) => parse_nvcc_release(&output).map(Some),
            None => Ok(None),
        }
    }

    fn fused_attention_kernel(&self) -> bool {
        features::fused_attention_compiled()
    }
}

fn read_proc(path: &'static str) -> Result<String, ProbeDegradation> {
    if !Path::new(path).exists() {
        return Err(ProbeDegradation::Unavailable {
            source_name: path,
            detail: "not present on this platform".to_string(),
        });
    }
    std::fs::read_to_string(path).map_err(|e| ProbeDegradation::Unavailable {
        source_name: path,
        detail: e.to_string(),
    })
}

/// Runs an external diagnostic tool. A missing binary is not a degradation,
/// it simply means the corresponding hardware is absent.
fn run_tool(command: &'static str, args: &[&str]) -> Result<Option<String>, ProbeDegradation> {
    let output = match Command::new(command).args(args).output() {
        Ok(out) => out,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(ProbeDegradation::Command { command, source }),
    };

    if !output.status.success() {
        return Err(ProbeDegradation::Unavailable {
            source_name: command,
            detail: format!(
                "exit status {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
}

fn parse_cpu_name(cpuinfo: &str) -> Result<String, ProbeDegradation> {
    cpuinfo
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim() == "model name")
        .map(|(_, value)| value.trim().to_string())
        .ok_or(ProbeDegradation::Parse {
            source_name: CPUINFO_PATH,
            field: "model name",
            detail: "no 'model name' entry".to_string(),
        })
}

/// Counts distinct `(physical id, core id)` pairs.
fn parse_physical_cores(cpuinfo: &str) -> Result<u32, ProbeDegradation> {
    let mut seen = std::collections::HashSet::new();
    let mut physical_id = "0";

    for line in cpuinfo.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "physical id" => physical_id = value.trim(),
            "core id" => {
                seen.insert((physical_id, value.trim()));
            }
            _ => {}
        }
    }

    if seen.is_empty() {
        return Err(ProbeDegradation::Parse {
            source_name: CPUINFO_PATH,
            field: "core id",
            detail: "no core topology entries".to_string(),
        });
    }
    Ok(seen.len() as u32)
}

fn parse_mem_total_gb(meminfo: &str) -> Result<f64, ProbeDegradation> {
    let raw = meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .ok_or(ProbeDegradation::Parse {
            source_name: MEMINFO_PATH,
            field: "MemTotal",
            detail: "MemTotal not found".to_string(),
        })?;

    let kb: u64 = raw
        .split_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| ProbeDegradation::Parse {
            source_name: MEMINFO_PATH,
            field: "MemTotal",
            detail: format!("expected integer kB value, got '{}'", raw.trim()),
        })?;

    Ok(round_gb(kb as f64 / (1024.0 * 1024.0)))
}

/// `sysctl -n hw.memsize` prints the physical memory in bytes.
fn parse_memsize_gb(output: &str) -> Result<f64, ProbeDegradation> {
    let bytes: u64 = output.trim().parse().map_err(|_| ProbeDegradation::Parse {
        source_name: "sysctl",
        field: "hw.memsize",
        detail: format!("expected integer byte count, got '{}'", output.trim()),
    })?;
    Ok(round_gb(bytes as f64 / (1024.0 * 1024.0 * 1024.0)))
}

/// Parses `name, memory_mib, compute_cap` CSV rows. Only the first device is
/// described; the row count is reported as the device count.
fn parse_nvidia_smi(output: &str) -> Result<Option<AcceleratorInfo>, ProbeDegradation> {
    let rows: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
    let Some(first) = rows.first() else {
        return Ok(None);
    };

    let fields: Vec<&str> = first.split(',').map(str::trim).collect();
    if fields.len() < 2 {
        return Err(ProbeDegradation::Parse {
            source_name: "nvidia-smi",
            field: "query row",
            detail: format!("unexpected row '{}'", first),
        });
    }

    let memory_gb = match fields[1].parse::<f64>() {
        Ok(mib) => round_gb(mib / 1024.0),
        Err(_) => {
            tracing::warn!(value = fields[1], "unreadable accelerator memory; assuming 0 GB");
            0.0
        }
    };

    let capability = match fields.get(2).map(|raw| raw.parse::<ComputeCapability>()) {
        Some(Ok(cc)) => Some(cc),
        Some(Err(e)) => {
            tracing::warn!(error = %e, "unreadable compute capability; assuming legacy tier");
            None
        }
        None => None,
    };

    Ok(Some(AcceleratorInfo {
        target: DeviceTarget::Cuda,
        name: fields[0].to_string(),
        memory_gb,
        capability,
        count: rows.len() as u32,
    }))
}

fn parse_nvcc_release(output: &str) -> Result<ToolchainVersion, ProbeDegradation> {
    let parse_err = || ProbeDegradation::Parse {
        source_name: "nvcc",
        field: "release",
        detail: "no 'release X.Y' in version banner".to_string(),
    };

    let after = output
        .split("release ")
        .nth(1)
        .ok_or_else(parse_err)?;
    let version = after
        .split(|c: char| c == ',' || c.is_whitespace())
        .next()
        .ok_or_else(parse_err)?;
    let (major, minor) = version.split_once('.').ok_or_else(parse_err)?;

    Ok(ToolchainVersion {
        major: major.parse().map_err(|_| parse_err())?,
        minor: minor.parse().map_err(|_| parse_err())?,
    })
}

fn round_gb(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
