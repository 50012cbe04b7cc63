use crate::agents::AgentKind;
use crate::task::ActionType;

/// Map a task's action type to the sub-agent that executes it.
pub fn route(action: ActionType) -> AgentKind {
    match action {
        ActionType::Add | ActionType::Edit | ActionType::Delete | ActionType::Move => {
            AgentKind::CodeWriter
        }
        ActionType::Refactor => AgentKind::Refactoring,
        ActionType::Test => AgentKind::TestExecutor,
        ActionType::Debug | ActionType::Fix => AgentKind::Debugging,
        ActionType::Document => AgentKind::Documentation,
        ActionType::Research => AgentKind::Research,
        ActionType::Analyze | ActionType::Review => AgentKind::Analysis,
    }
}

/// Route from a raw action-type string, for callers that have not parsed
/// it yet. Unknown strings go to the generic CodeWriter with a warning.
pub fn route_raw(action: &str) -> AgentKind {
    match ActionType::parse(action) {
        Some(parsed) => route(parsed),
        None => {
            tracing::warn!(action, "unknown action type; routing to CodeWriter");
            AgentKind::CodeWriter
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_table_matches_the_contract() {
        assert_eq!(route(ActionType::Add), AgentKind::CodeWriter);
        assert_eq!(route(ActionType::Edit), AgentKind::CodeWriter);
        assert_eq!(route(ActionType::Refactor), AgentKind::Refactoring);
        assert_eq!(route(ActionType::Test), AgentKind::TestExecutor);
        assert_eq!(route(ActionType::Debug), AgentKind::Debugging);
        assert_eq!(route(ActionType::Fix), AgentKind::Debugging);
        assert_eq!(route(ActionType::Document), AgentKind::Documentation);
        assert_eq!(route(ActionType::Research), AgentKind::Research);
        assert_eq!(route(ActionType::Analyze), AgentKind::Analysis);
        assert_eq!(route(ActionType::Review), AgentKind::Analysis);
    }

    #[test]
    fn aliases_route_through_parsing() {
        assert_eq!(route_raw("docs"), AgentKind::Documentation);
        assert_eq!(route_raw("investigate"), AgentKind::Research);
    }

    #[test]
    fn unknown_action_routes_to_code_writer() {
        assert_eq!(route_raw("transmogrify"), AgentKind::CodeWriter);
    }
}
