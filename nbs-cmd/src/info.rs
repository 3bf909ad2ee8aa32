use std::{
    collections::BTreeMap,
    fs::File,
    io::{stdout, BufReader, Read, Write},
    path::Path,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use handlebars::handlebars_helper;
use nbs::{
    link::{FrameSource, LinkStats, StreamFrames},
    transport::{missing_frames, Command, Frame, MAX_FRAME_LEN},
};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone)]
pub enum Format {
    Json,
    Text,
}

impl clap::ValueEnum for Format {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::Json, Self::Text]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        match self {
            Self::Json => Some(clap::builder::PossibleValue::new("json")),
            Self::Text => Some(clap::builder::PossibleValue::new("text")),
        }
    }
}

#[derive(Default, Debug, Clone, Serialize)]
struct ProductSummary {
    products: usize,
    frames: usize,
    data_bytes: usize,
    compressed: usize,
}

#[derive(Default, Debug, Clone, Serialize)]
struct Summary {
    total_frames: usize,
    time_frames: usize,
    invalid_frames: usize,
    missing_frames: usize,
    runs: Vec<u16>,
    first_send_time: Option<DateTime<Utc>>,
    last_send_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
struct LinkSummary {
    mean_size: f64,
    min_size: usize,
    max_size: usize,
    total_bytes: usize,
}

impl From<&LinkStats> for LinkSummary {
    fn from(stats: &LinkStats) -> Self {
        LinkSummary {
            mean_size: stats.mean_size(),
            min_size: stats.min_size,
            max_size: stats.max_size,
            total_bytes: stats.total_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct Info {
    filename: String,
    summary: Summary,
    link: LinkSummary,
    product_types: BTreeMap<String, ProductSummary>,
}

fn summarize<R: Read>(filename: &str, reader: R) -> Result<Info> {
    let mut frames = StreamFrames::new(reader);
    let mut buf = vec![0u8; MAX_FRAME_LEN];
    let mut link = LinkStats::default();
    let mut summary = Summary::default();
    let mut product_types: BTreeMap<String, ProductSummary> = BTreeMap::default();
    let mut last: Option<(u32, u16)> = None;
    // product sequence number and type of the product in progress
    let mut current: Option<(u32, String)> = None;

    loop {
        let n = frames.recv_frame(&mut buf).context("reading frames")?;
        if n == 0 {
            break;
        }
        link.add(n);
        summary.total_frames += 1;

        let frame = match Frame::decode(&buf[..n]) {
            Ok(frame) => frame,
            Err(err) => {
                debug!("invalid frame at offset {}: {err}", frames.offset() - n);
                summary.invalid_frames += 1;
                continue;
            }
        };

        let (seq, run) = (frame.header.sequence, frame.header.run);
        match last {
            Some((_, last_run)) if last_run != run => summary.runs.push(run),
            Some((last_seq, _)) => {
                let missing = missing_frames(seq, last_seq);
                if missing != u32::MAX {
                    summary.missing_frames += missing as usize;
                }
            }
            None => summary.runs.push(run),
        }
        last = Some((seq, run));

        if frame.header.command == Command::Time {
            summary.time_frames += 1;
            continue;
        }
        let Some(pdh) = frame.pdh else {
            continue;
        };
        if let Some(psh) = frame.psh {
            let name = format!("{:?}", psh.prod_type);
            product_types.entry(name.clone()).or_default().products += 1;
            current = Some((pdh.prod_seq_num, name));

            let sent = DateTime::from_timestamp(i64::from(psh.ncf_send_time), 0);
            if summary.first_send_time.is_none() {
                summary.first_send_time = sent;
            }
            if sent.is_some() {
                summary.last_send_time = sent;
            }
        }
        let name = match &current {
            Some((prod_seq_num, name)) if *prod_seq_num == pdh.prod_seq_num => name.clone(),
            _ => String::from("Unknown"),
        };
        let entry = product_types.entry(name).or_default();
        entry.frames += 1;
        entry.data_bytes += frame.data.len();
        if pdh.transfer_type.is_compressed() {
            entry.compressed += 1;
        }
    }

    Ok(Info {
        filename: filename.to_string(),
        summary,
        link: LinkSummary::from(&link),
        product_types,
    })
}

pub fn info(fpath: &Path, format: &Format) -> Result<()> {
    let reader = File::open(fpath).context("opening input")?;
    let info = summarize(&fpath.to_string_lossy(), BufReader::new(reader))?;

    match format {
        Format::Json => {
            serde_json::to_writer_pretty(stdout(), &info).context("serializing to json")
        }
        Format::Text => {
            let data = render_text(&info).context("serializing info")?;
            stdout()
                .write_all(str::as_bytes(&data))
                .context("writing to stdout")
        }
    }
}

fn render_text(info: &Info) -> Result<String> {
    handlebars_helper!(left_pad: |num: u64, v: Json| {
        let v = match v {
            serde_json::Value::String(s) => s.to_owned(),
            serde_json::Value::Null => String::new(),
            _ => v.to_string()
        };
        let num = usize::try_from(num).unwrap_or_default().max(v.len());
        format!("{v:>num$}")
    });
    let mut hb = handlebars::Handlebars::new();
    hb.register_helper("lpad", Box::new(left_pad));
    hb.register_template_string("info", TEXT_TEMPLATE)
        .context("registering template")?;

    hb.render("info", &info).context("rendering text")
}

const TEXT_TEMPLATE: &str = r"{{ filename }}
===============================================================================
First:    {{ summary.first_send_time }}
Last:     {{ summary.last_send_time }}
Runs:     {{ #each summary.runs }}{{ this }}{{ #if @last }}{{ else }}, {{ /if }}{{ /each }}
Frames:   {{ summary.total_frames }}
Time:     {{ summary.time_frames }}
Invalid:  {{ summary.invalid_frames }}
Missing:  {{ summary.missing_frames }}
Bytes:    {{ link.total_bytes }}
Sizes:    min={{ link.min_size }} max={{ link.max_size }} mean={{ link.mean_size }}
-------------------------------------------------------------------------------
Product Type          Products     Frames   Compressed     Data Bytes
-------------------------------------------------------------------------------
{{ #each product_types }}{{ lpad 16 @key }}  {{ lpad 12 products }} {{ lpad 10 frames }} {{ lpad 12 compressed }} {{ lpad 14 data_bytes }}
{{/each }}
";
