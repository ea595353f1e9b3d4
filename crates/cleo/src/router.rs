//! Pre-routing heuristic: full pipeline or direct answer.
//!
//! Decides whether a request needs the full MAS pipeline (planner →
//! executors → reviewer → planner close-out) or the planner can answer
//! directly. The planner may override the heuristic with an explicit
//! `ROUTE:` line in its output.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::protocols::RouteDecision;

// Signal words that need tools, files, or execution. Both languages the
// system is deployed in.
const MAS_SIGNALS_ZH: &[&str] = &[
    "写", "创建", "生成", "构建", "编写", "运行", "执行", "搜索", "下载", "分析", "计算",
    "部署", "截图", "安装", "配置", "修改", "编辑", "删除", "上传", "翻译", "对比", "报告",
    "代码", "文件", "脚本", "网站", "数据库",
];

const MAS_SIGNALS_EN: &[&str] = &[
    "write", "create", "generate", "build", "code", "file", "run", "execute", "search",
    "download", "analyze", "compute", "calculate", "deploy", "install", "configure",
    "screenshot", "browser", "edit", "delete", "upload", "compare", "report", "script",
    "database", "website", "translate",
];

// Multi-step indicators: the request needs decomposition.
const MULTI_STEP_SIGNALS: &[&str] = &[
    " and then ", "first ", "step 1", "步骤", "然后再", "接着", "首先", "第一步", "分别",
    "一方面", "另一方面", "同时",
];

// Simple knowledge Q&A indicators.
const DIRECT_SIGNALS_ZH: &[&str] = &[
    "什么是", "解释", "定义", "描述", "介绍", "说说", "是什么", "怎么理解", "含义",
];

const DIRECT_SIGNALS_EN: &[&str] = &[
    "what is", "explain", "define", "describe", "tell me about", "how does", "what does",
    "meaning of",
];

/// Heuristic pre-classification of task complexity.
///
/// DIRECT_ANSWER requires all of: single goal (no multi-step indicators),
/// no tool/file/execution signals, and a knowledge-type question or a
/// trivial query. Everything else routes to the pipeline, the
/// conservative default.
pub fn classify_task(description: &str) -> RouteDecision {
    let desc_lower = description.to_lowercase();
    let desc_lower = desc_lower.trim();

    // Very short queries are likely simple.
    if desc_lower.chars().count() < 5 {
        return RouteDecision::DirectAnswer;
    }

    if MULTI_STEP_SIGNALS.iter().any(|s| desc_lower.contains(s)) {
        return RouteDecision::MasPipeline;
    }

    if MAS_SIGNALS_ZH
        .iter()
        .chain(MAS_SIGNALS_EN)
        .any(|s| desc_lower.contains(s))
    {
        return RouteDecision::MasPipeline;
    }

    if DIRECT_SIGNALS_ZH
        .iter()
        .chain(DIRECT_SIGNALS_EN)
        .any(|s| desc_lower.contains(s))
    {
        return RouteDecision::DirectAnswer;
    }

    // A short question mark query is likely simple.
    if (description.contains('?') || description.contains('？'))
        && description.chars().count() < 50
    {
        return RouteDecision::DirectAnswer;
    }

    RouteDecision::MasPipeline
}

static ROUTE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^ROUTE:\s*(\S+)").expect("static regex"));

/// Find an explicit `ROUTE: DIRECT_ANSWER` / `ROUTE: MAS_PIPELINE`
/// declaration in planner output. Supersedes the heuristic when present.
pub fn parse_route_from_output(planner_output: &str) -> Option<RouteDecision> {
    for line in planner_output.trim().lines() {
        let stripped = line.trim();
        if let Some(captures) = ROUTE_RE.captures(stripped) {
            let route = captures[1].to_uppercase();
            match route.as_str() {
                "DIRECT_ANSWER" => return Some(RouteDecision::DirectAnswer),
                "MAS_PIPELINE" => return Some(RouteDecision::MasPipeline),
                other => {
                    tracing::warn!(route = other, "unrecognized ROUTE directive");
                }
            }
        }
    }
    None
}
