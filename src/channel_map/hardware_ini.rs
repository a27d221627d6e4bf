//! `hardware.ini` generation for the broadcaster
//!
//! Output is a pure function of the map: identical maps render identical bytes.

use super::ChannelMap;

/// Device name the broadcaster expects for E1.31 output
pub const DEVICE: &str = "sACNDevice";

/// Render the `[hardware]`, `[channel]` and `[state]` blocks
pub fn render(map: &ChannelMap) -> String {
    let mut blocks = Vec::with_capacity(1 + map.len() * 2);

    blocks.push(format!(
        "[hardware]\ndevice = {}\nuniverse = {}\nchannels = {}\nresend_delay = {}\n",
        DEVICE,
        map.universe(),
        map.channel_count(),
        map.resend_delay().as_millis()
    ));

    for channel in map.channels() {
        blocks.push(format!(
            "[channel]\nname = {}\nchannel = {}\n",
            channel.name, channel.channel_index
        ));
    }

    for channel in map.channels() {
        let entry = channel.entry;
        let mut block = String::with_capacity(192);
        block.push_str("[state]\ncondition = Always\n");
        block.push_str(&format!("target = {}\neffect = variable\n", channel.name));
        block.push_str(&format!(
            "input = {}\nmin_input = {}\nmax_input = {}\n",
            entry.input, entry.min_input, entry.max_input
        ));
        block.push_str(&format!(
            "min_output = {:?}\nmax_output = {:?}\n",
            entry.min_output, entry.max_output
        ));
        blocks.push(block);
    }

    // One blank line between blocks, a single newline at the end
    blocks.join("\n")
}

#[cfg(test)]
mod tests {
    use crate::channel_map::{ChannelMap, ChannelMapConfig};

    fn map(variables: &[&str]) -> ChannelMap {
        ChannelMap::generate(&ChannelMapConfig {
            variables: variables.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_render_exact_layout() {
        let ini = map(&["hull", "impulse"]).to_hardware_ini();
        let expected = "\
[hardware]
device = sACNDevice
universe = 2
channels = 50
resend_delay = 50

[channel]
name = hull
channel = 1

[channel]
name = impulse
channel = 2

[state]
condition = Always
target = hull
effect = variable
input = Hull
min_input = 0
max_input = 100
min_output = 0.0
max_output = 1.0

[state]
condition = Always
target = impulse
effect = variable
input = Impulse
min_input = -1
max_input = 1
min_output = 0.0
max_output = 1.0
";
        assert_eq!(ini, expected);
    }

    #[test]
    fn test_regeneration_is_byte_stable() {
        let first = map(&["warp", "hull", "redAlert"]).to_hardware_ini();
        let second = map(&["redAlert", "warp", "hull"]).to_hardware_ini();
        assert_eq!(first.as_bytes(), second.as_bytes());
        assert!(first.ends_with("max_output = 1.0\n"));
        assert!(!first.ends_with("\n\n"));
    }

    #[test]
    fn test_default_map_has_block_per_channel() {
        let ini = ChannelMap::generate(&ChannelMapConfig::default()).unwrap().to_hardware_ini();
        assert_eq!(ini.matches("[channel]").count(), 12);
        assert_eq!(ini.matches("[state]").count(), 12);
        assert!(ini.contains("input = Shield1\n"));
    }
}
