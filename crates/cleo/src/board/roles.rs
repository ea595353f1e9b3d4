//! Role-based claim rules.
//!
//! Two tables govern who may claim what: a role→agents map (symmetric
//! enabling) and an agent→roles restriction (asymmetric blocking). Strict
//! roles permit no substring fallback, which keeps an executor whose role
//! text contains the word "implement" from claiming a review task and vice
//! versa.

/// Agents allowed to claim a given required_role keyword.
fn role_agents(role: &str) -> Option<&'static [&'static str]> {
    const PLANNERS: &[&str] = &["leo", "planner"];
    const EXECUTORS: &[&str] = &["jerry", "executor", "coder", "developer", "builder"];
    const REVIEWERS: &[&str] = &["alic", "reviewer", "auditor"];
    match role {
        "planner" | "plan" => Some(PLANNERS),
        "implement" | "execute" | "code" => Some(EXECUTORS),
        "review" | "critique" => Some(REVIEWERS),
        _ => None,
    }
}

/// Roles that can only be claimed by their mapped agents.
fn is_strict_role(role: &str) -> bool {
    matches!(role, "planner" | "plan" | "review" | "critique")
}

/// Allowed roles for restricted agent-id keywords.
///
/// Restricted agents (reviewers/auditors) may only claim tasks whose
/// required_role is in their allowed set; a generic task (no required_role)
/// never matches them.
fn restriction_for(agent_id: &str) -> Option<&'static [&'static str]> {
    const REVIEW_ONLY: &[&str] = &["review", "critique"];
    for keyword in ["alic", "reviewer", "auditor"] {
        if agent_id.contains(keyword) {
            return Some(REVIEW_ONLY);
        }
    }
    None
}

/// Agent-level restriction check, applied before role matching.
pub fn agent_may_claim(agent_id: &str, required_role: Option<&str>) -> bool {
    let aid = agent_id.to_lowercase();
    match restriction_for(&aid) {
        Some(allowed) => match required_role {
            Some(role) => allowed.contains(&role.to_lowercase().as_str()),
            None => false,
        },
        None => true,
    }
}

/// Does this agent qualify for a task's required_role?
pub fn role_matches(required_role: &str, agent_id: &str) -> bool {
    let req = required_role.to_lowercase();
    let aid = agent_id.to_lowercase();

    // Direct id equality.
    if req == aid {
        return true;
    }

    // Map-based match.
    if let Some(allowed) = role_agents(&req) {
        if allowed.contains(&aid.as_str()) {
            return true;
        }
    }

    // Strict roles stop here.
    if is_strict_role(&req) {
        return false;
    }

    // Loose fallback: agent id contains the keyword.
    aid.contains(&req)
}
