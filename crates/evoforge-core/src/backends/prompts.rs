use regex::{Captures, Regex};
use std::sync::OnceLock;

pub const NO_CODE_DIAGNOSTIC: &str = "Could not find a code block inside your response.";
pub const NO_CODE_REPROMPT: &str =
    "Could not find a code block inside your previous message. Please format correctly.";

fn c_comment_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?sm)//.*?$|/\*.*?\*/|'(?:\\.|[^\\'])*'|"(?:\\.|[^\\"])*""#)
            .expect("static regex")
    })
}

/// Removes C/C++ comments, leaving string and char literals untouched.
/// Each comment collapses to a single space so adjacent tokens stay apart.
pub fn strip_c_comments(code: &str) -> String {
    c_comment_pattern()
        .replace_all(code, |caps: &Captures| {
            let m = &caps[0];
            if m.starts_with('/') {
                " ".to_string()
            } else {
                m.to_string()
            }
        })
        .into_owned()
}

/// Parent code blocks for a mutation prompt, best first, labelled `// Version i`.
pub fn version_blocks(lang: &str, parents: &[String]) -> String {
    let mut out = String::new();
    for (i, code) in parents.iter().enumerate() {
        out.push_str(&format!(
            "```{lang}\n// Version {i}\n{}\n```\n",
            strip_c_comments(code).trim()
        ));
    }
    out
}

/// Shared repair request. Build systems splice the code into a larger file, so
/// line numbers in the logs are offset.
pub fn debug_prompt(stdout: &str, stderr: &str) -> String {
    format!(
        "Your code failed to build or load. The logs are below. Work out what went wrong and \
         reply with a corrected version of the whole code in a single code block, as before. \
         Line numbers in the logs may not match your code: it is inserted into a larger file.\n\n\
         ### <stdout>: {}\n\n### <stderr>: {}\n",
        stdout.trim(),
        stderr.trim()
    )
}

pub fn initial_prompt(context: &str, lang: &str, plan: &str) -> String {
    format!(
        "{context}\n\nUse this format for your reply:\n{plan}\nCode:\n```{lang}\n<your code here>\n```\n"
    )
}

pub fn mutate_prompt(context: &str, lang: &str, parents: &[String], placeholder: &str) -> String {
    format!(
        "{context}\n\nBelow are earlier versions, best first. Write a new version that improves on \
         them or explores a different idea. A rename or a reordering is not a new version.\n\n{}\
         Now write your new version in a single code block:\nCode:\n```{lang}\n{placeholder}\n```\n",
        version_blocks(lang, parents)
    )
}

pub const REPLY_PLAN: &str = "\
<reason about the inputs and the main tradeoff>
<propose two or three concrete, well-defined ideas>
<pick one, give it a short title, and describe it in plain English>
<write the implementation in a single code block>";

pub const WEBCACHE_CONTEXT: &str = "\
You are designing an eviction heuristic for a priority-queue cache. On every access the \
object is removed from the queue, its priority is recomputed with `priority`, and it is \
reinserted; the lowest priority is evicted when space is needed.

```cpp
int priority(
    uint64_t current_time, obj_id_t obj_id, pq_cache_obj_info& obj_info,
    CountsInfo<int32_t>& counts, AgeInfo<int64_t> ages, SizeInfo<int64_t>& sizes,
    History& history
);
```

Higher values keep an object cached longer. `obj_info` carries the object's access count, \
last access time, size and insertion time; `counts`, `ages` and `sizes` summarize the \
objects currently cached; `history` holds recently evicted objects. Write only the body of \
a function with exactly this signature and use only these inputs.";

pub const TCP_CONTEXT: &str = "\
You are a networking engineer designing a TCP congestion control algorithm for the Linux \
kernel. Implement both functions:

```c
static u32 cong_control_logic(u8 ca_state, const struct heuristic_state *st, const struct rate_sample *rs, u32 prev_cwnd);
static u32 undo_cwnd_logic(u8 ca_state, const struct heuristic_state *st, u32 prev_cwnd);
```

`ca_state` is the kernel congestion state (TCP_CA_Open, TCP_CA_Disorder, TCP_CA_CWR, \
TCP_CA_Recovery, TCP_CA_Loss). `rs` is the kernel rate sample (delivered, interval_us, \
rtt_us, losses, acked_sacked, prior_in_flight, is_app_limited). `st` tracks flow-wide \
statistics (min/max rtt and bandwidth, inflight bytes, max cwnd seen) and a history of \
per-RTT windows via `history_get(st, i)`.

Rules: use only these inputs, no globals, no memory allocation, no floating point (use \
integer math such as `(x * 8) / 10`). The prototypes already exist; do not redeclare them.";

pub const TCP_PLACEHOLDER: &str = "// cong_control_logic and undo_cwnd_logic";
