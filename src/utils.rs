// A simple wrapper around fs::read_to_string adding details about the
// problematic file.
use std::path::Path;
use tch::Device;

pub(crate) fn read_to_string<P: AsRef<Path>>(path: P) -> anyhow::Result<String> {
    std::fs::read_to_string(path.as_ref()).map_err(|e| {
        let context = format!("error reading {:?}", path.as_ref().to_string_lossy());
        anyhow::Error::new(e).context(context)
    })
}

/// Picks the accelerator when one is available, unless `cpu` is set.
pub fn device(cpu: bool) -> Device {
    if cpu {
        Device::Cpu
    } else if tch::utils::has_mps() {
        Device::Mps
    } else {
        Device::cuda_if_available()
    }
}
