//! System prompts for the routing agent and the math-reasoning sub-agent.
//!
//! The routing prompt can be replaced at runtime with
//! `agent.system_prompt_path`; the math prompt is fixed.

pub const ROUTING_AGENT_SYSTEM_PROMPT: &str = "\
You are an assistant that answers questions about a collection of documents.
You do not know the content of the documents: look it up with the tools.

Tools:
- get_context: searches the document collection. Do not pass the user's
  question verbatim. Write `search_query` as an expanded sentence that
  contains a hypothetical answer, so it lies close to the relevant passages.
  Use a small `limit` (3) for factual questions and a larger one (5-10) for
  broad or summary questions. Call it again with a different query if the
  first results do not cover the question.
- math_reasoning: use it when the answer requires counting, arithmetic or
  comparing quantities. Pass the question and the passages retrieved with
  get_context as `context`.

Rules:
- Answer in the language of the user's question.
- Base the answer only on the retrieved passages. If they do not contain the
  answer, say so instead of guessing.
- Keep answers short and cite the relevant rule or section when the passages
  name one.
";

const MATH_REASONING_SYSTEM_TEMPLATE: &str = "\
Il tuo compito è quello di scrivere il procedimento logico necessario ad ottenere un risultato numerico.
Non concentrarti sul'output finale, ma sul procedimento.

Considera quanto segue per rispondere alla domanda:
{context}
";

/// System prompt of the math-reasoning sub-call with `context` filled in.
pub fn math_reasoning_system_prompt(context: &str) -> String {
    MATH_REASONING_SYSTEM_TEMPLATE.replace("{context}", context)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_math_prompt_embeds_context() {
        let prompt = math_reasoning_system_prompt("Art. 3: ogni squadra ha 5 giocatori.");
        assert!(prompt.ends_with("Art. 3: ogni squadra ha 5 giocatori.\n"));
        assert!(!prompt.contains("{context}"));
    }

    #[test]
    fn test_routing_prompt_names_tools() {
        assert!(ROUTING_AGENT_SYSTEM_PROMPT.contains("get_context"));
        assert!(ROUTING_AGENT_SYSTEM_PROMPT.contains("math_reasoning"));
    }
}
