//! ffmpeg invocation for live browser-playable MP4.

/// Request headers ffmpeg sends upstream, CRLF separated.
///
/// ffmpeg warns when the block lacks a trailing CRLF, so one is appended.
pub fn header_block(user_agent: &str, referer: Option<&str>) -> String {
    let mut lines = vec![format!("User-Agent: {user_agent}"), "Accept: */*".to_string()];
    if let Some(referer) = referer {
        lines.push(format!("Referer: {referer}"));
    }
    format!("{}\r\n", lines.join("\r\n"))
}

/// Arguments for one transcode: H.264 baseline + AAC in fragmented MP4,
/// written to stdout.
pub fn build_args(upstream_url: &str, headers: &str) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error"]
        .iter()
        .map(ToString::to_string)
        .collect();

    args.push("-headers".to_string());
    args.push(headers.to_string());
    args.push("-i".to_string());
    args.push(upstream_url.to_string());

    args.extend(
        [
            // Fragmented so playback can start before the file ends
            "-movflags", "frag_keyframe+empty_moov",
            "-c:v", "libx264",
            "-preset", "veryfast",
            "-pix_fmt", "yuv420p",
            "-profile:v", "baseline",
            "-level", "3.1",
            "-c:a", "aac",
            "-b:a", "128k",
            "-f", "mp4",
            "pipe:1",
        ]
        .iter()
        .map(ToString::to_string),
    );

    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_block_without_referer() {
        assert_eq!(
            header_block("Mozilla/5.0", None),
            "User-Agent: Mozilla/5.0\r\nAccept: */*\r\n"
        );
    }

    #[test]
    fn header_block_with_referer() {
        let block = header_block("Mozilla/5.0", Some("https://site.example/watch/1"));
        let lines: Vec<&str> = block.trim_end().split("\r\n").collect();
        assert_eq!(
            lines,
            vec![
                "User-Agent: Mozilla/5.0",
                "Accept: */*",
                "Referer: https://site.example/watch/1"
            ]
        );
    }

    #[test]
    fn args_have_input_before_output() {
        let headers = header_block("UA", None);
        let args = build_args("https://cdn.example/master.m3u8", &headers);

        let headers_idx = args.iter().position(|a| a == "-headers").unwrap();
        let input_idx = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[headers_idx + 1], headers);
        assert_eq!(args[input_idx + 1], "https://cdn.example/master.m3u8");
        assert!(headers_idx < input_idx);
        assert_eq!(args.last().unwrap(), "pipe:1");
    }

    #[test]
    fn args_select_browser_codecs() {
        let args = build_args("https://cdn.example/v.mkv", "");
        let expected = [
            ("-movflags", "frag_keyframe+empty_moov"),
            ("-c:v", "libx264"),
            ("-preset", "veryfast"),
            ("-pix_fmt", "yuv420p"),
            ("-profile:v", "baseline"),
            ("-level", "3.1"),
            ("-c:a", "aac"),
            ("-b:a", "128k"),
            ("-f", "mp4"),
            ("-loglevel", "error"),
        ];
        for (flag, value) in expected {
            let idx = args.iter().position(|a| a == flag).unwrap();
            assert_eq!(args[idx + 1], value, "{flag}");
        }
    }
}
