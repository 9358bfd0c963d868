/// Per-direction bandwidth hints written into every outgoing description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthCaps {
    pub video_kbps: u32,
    pub audio_kbps: u32,
}

impl Default for BandwidthCaps {
    fn default() -> Self {
        Self {
            video_kbps: 2500,
            audio_kbps: 64,
        }
    }
}

impl BandwidthCaps {
    fn limit_for(&self, media_line: &str) -> Option<u32> {
        if media_line.starts_with("m=video") {
            Some(self.video_kbps)
        } else if media_line.starts_with("m=audio") {
            Some(self.audio_kbps)
        } else {
            None
        }
    }
}

struct Section {
    media_index: usize,
    limit: Option<u32>,
    written: bool,
}

/// Writes a `b=AS:` line into every audio and video section, replacing existing
/// bandwidth lines. The line goes after the section's `c=` line, or right after `m=`
/// when the section has none. Other sections pass through untouched.
pub fn apply_bandwidth_caps(sdp: &str, caps: BandwidthCaps) -> String {
    if sdp.trim().is_empty() {
        return sdp.to_string();
    }
    let mut lines: Vec<String> = Vec::new();
    let mut section: Option<Section> = None;

    for line in sdp.lines() {
        if line.starts_with("m=") {
            finish_section(&mut lines, section.take());
            section = Some(Section {
                media_index: lines.len(),
                limit: caps.limit_for(line),
                written: false,
            });
            lines.push(line.to_string());
            continue;
        }
        if let Some(current) = section.as_mut() {
            if let Some(kbps) = current.limit {
                if line.starts_with("b=AS:") || line.starts_with("b=TIAS:") {
                    continue;
                }
                if line.starts_with("c=") && !current.written {
                    lines.push(line.to_string());
                    lines.push(format!("b=AS:{kbps}"));
                    current.written = true;
                    continue;
                }
            }
        }
        lines.push(line.to_string());
    }
    finish_section(&mut lines, section.take());

    let mut out = lines.join("\r\n");
    out.push_str("\r\n");
    out
}

fn finish_section(lines: &mut Vec<String>, section: Option<Section>) {
    if let Some(Section {
        media_index,
        limit: Some(kbps),
        written: false,
    }) = section
    {
        lines.insert(media_index + 1, format!("b=AS:{kbps}"));
    }
}
