//! Few-shot prompt construction.
//!
//! A prompt is the worked examples joined by blank lines, a newline, the
//! instruction, and the target row rendered with its answer fields left
//! empty (the trailing space after the last label is dropped):
//!
//! ```text
//! Classical: 學而時習之
//! English: To learn and practice it in due time
//!
//! Classical: 溫故而知新
//! English: Review the old to learn the new
//! Translate the following sentence from Classical Chinese into English. Provide only the translation:Classical: 有朋自遠方來
//! English:
//! ```

use crate::config::ChatTemplateKind;
use crate::dataset::TranslationRow;

/// Instruction for direct translation.
pub const DIRECT_INSTRUCTION: &str =
    "Translate the following sentence from Classical Chinese into English. Provide only the translation:";

/// Instruction for chain-of-thought translation.
pub const COT_INSTRUCTION: &str = "Translate the following sentence from classical Chinese into modern Chinese and then into English. Provide only the translation:";

/// Row layout used for examples, targets and training text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptTemplate {
    /// `Classical: …\nEnglish: …`
    Direct,
    /// `Classical: …\nModern: …\nEnglish: …`
    ChainOfThought,
}

impl PromptTemplate {
    /// Template for the `cot` flag.
    #[must_use]
    pub fn from_cot(cot: bool) -> Self {
        if cot {
            Self::ChainOfThought
        } else {
            Self::Direct
        }
    }

    /// Instruction paired with this template.
    #[must_use]
    pub fn instruction(self) -> &'static str {
        match self {
            Self::Direct => DIRECT_INSTRUCTION,
            Self::ChainOfThought => COT_INSTRUCTION,
        }
    }

    /// Fill the template. `modern` is ignored by the direct layout.
    #[must_use]
    pub fn format(self, classical: &str, modern: &str, english: &str) -> String {
        match self {
            Self::Direct => format!("Classical: {classical}\nEnglish: {english}"),
            Self::ChainOfThought => {
                format!("Classical: {classical}\nModern: {modern}\nEnglish: {english}")
            }
        }
    }

    /// Fully rendered row.
    #[must_use]
    pub fn render(self, row: &TranslationRow) -> String {
        self.format(
            &row.classical,
            row.modern.as_deref().unwrap_or_default(),
            &row.english,
        )
    }

    /// Row with answer fields empty and the trailing separator removed.
    #[must_use]
    pub fn render_query(self, row: &TranslationRow) -> String {
        let mut query = self.format(&row.classical, "", "");
        query.pop();
        query
    }

    /// Text a training row contributes to the language-modelling objective.
    #[must_use]
    pub fn training_text(self, row: &TranslationRow) -> String {
        match &row.text {
            Some(text) if !text.is_empty() => text.clone(),
            _ => self.render(row),
        }
    }
}

/// Builds prompts against a fixed example block.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    template: PromptTemplate,
    examples: String,
}

impl PromptBuilder {
    /// Render the example block once.
    #[must_use]
    pub fn new(template: PromptTemplate, examples: &[TranslationRow]) -> Self {
        let examples = examples
            .iter()
            .map(|row| template.render(row))
            .collect::<Vec<_>>()
            .join("\n\n");
        Self { template, examples }
    }

    /// Rendered example block, empty for zero shots.
    #[must_use]
    pub fn examples(&self) -> &str {
        &self.examples
    }

    /// Template in use.
    #[must_use]
    pub fn template(&self) -> PromptTemplate {
        self.template
    }

    /// Prompt for one target row.
    #[must_use]
    pub fn build(&self, target: &TranslationRow) -> String {
        let query = self.template.render_query(target);
        let instruction = self.template.instruction();
        let mut prompt =
            String::with_capacity(self.examples.len() + instruction.len() + query.len() + 1);
        prompt.push_str(&self.examples);
        prompt.push('\n');
        prompt.push_str(instruction);
        prompt.push_str(&query);
        prompt
    }
}

/// Chat wrapping applied to a prompt before tokenization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatTemplate {
    kind: ChatTemplateKind,
}

/// Llama 3 end-of-turn marker, also a generation terminator.
pub const LLAMA3_EOT: &str = "<|eot_id|>";

impl ChatTemplate {
    /// Template of the given kind.
    #[must_use]
    pub fn new(kind: ChatTemplateKind) -> Self {
        Self { kind }
    }

    /// Wrap `content` as a single user turn followed by the assistant header.
    #[must_use]
    pub fn apply(&self, content: &str) -> String {
        match self.kind {
            ChatTemplateKind::Llama3 => format!(
                "<|begin_of_text|><|start_header_id|>user<|end_header_id|>\n\n{}{LLAMA3_EOT}<|start_header_id|>assistant<|end_header_id|>\n\n",
                content.trim()
            ),
            ChatTemplateKind::Plain => content.to_string(),
        }
    }

    /// Extra stop tokens besides the tokenizer's EOS.
    #[must_use]
    pub fn stop_tokens(&self) -> &'static [&'static str] {
        match self.kind {
            ChatTemplateKind::Llama3 => &[LLAMA3_EOT],
            ChatTemplateKind::Plain => &[],
        }
    }
}

/// Prompts and their references, index-aligned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvalSet {
    /// Chat-wrapped prompts.
    pub prompts: Vec<String>,
    /// One single-reference list per prompt.
    pub references: Vec<Vec<String>>,
}

impl EvalSet {
    /// Build prompts for every row in `predict`.
    #[must_use]
    pub fn build(
        builder: &PromptBuilder,
        chat: &ChatTemplate,
        predict: &[TranslationRow],
    ) -> Self {
        let (prompts, references) = predict
            .iter()
            .map(|row| (chat.apply(&builder.build(row)), vec![row.english.clone()]))
            .unzip();
        Self {
            prompts,
            references,
        }
    }

    /// Number of prompts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    /// True when there is nothing to predict.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows() -> Vec<TranslationRow> {
        vec![
            TranslationRow::new("學而時習之", "To learn and practice it").with_modern("學習並溫習"),
            TranslationRow::new("溫故而知新", "Review the old").with_modern("溫習舊知"),
            TranslationRow::new("有朋自遠方來", "A friend comes").with_modern("有朋友從遠方來"),
        ]
    }

    #[test]
    fn test_zero_shot_prompt() {
        let builder = PromptBuilder::new(PromptTemplate::Direct, &[]);
        let prompt = builder.build(&rows()[2]);
        assert_eq!(
            prompt,
            format!("\n{DIRECT_INSTRUCTION}Classical: 有朋自遠方來\nEnglish:")
        );
    }

    #[test]
    fn test_few_shot_block() {
        let rows = rows();
        let builder = PromptBuilder::new(PromptTemplate::Direct, &rows[..2]);
        assert_eq!(
            builder.examples(),
            "Classical: 學而時習之\nEnglish: To learn and practice it\n\nClassical: 溫故而知新\nEnglish: Review the old"
        );
        let prompt = builder.build(&rows[2]);
        assert!(prompt.starts_with(builder.examples()));
        assert_eq!(prompt.matches("Classical:").count(), 3);
        assert!(!prompt.contains("Modern:"));
    }

    #[test]
    fn test_cot_prompt() {
        let rows = rows();
        let builder = PromptBuilder::new(PromptTemplate::ChainOfThought, &rows[..1]);
        let prompt = builder.build(&rows[2]);
        assert!(prompt.contains("Modern: 學習並溫習"));
        assert!(prompt.contains(COT_INSTRUCTION));
        assert!(prompt.ends_with("Classical: 有朋自遠方來\nModern: \nEnglish:"));
    }

    #[test]
    fn test_query_strips_only_separator() {
        for template in [PromptTemplate::Direct, PromptTemplate::ChainOfThought] {
            for classical in ["a", "子曰", "ends with space "] {
                let row = TranslationRow::new(classical, "x");
                let query = template.render_query(&row);
                assert!(query.ends_with("English:"));
                assert!(query.contains(classical));
            }
        }
    }

    #[test]
    fn test_training_text_prefers_text_field() {
        let mut row = TranslationRow::new("a", "b");
        assert_eq!(
            PromptTemplate::Direct.training_text(&row),
            "Classical: a\nEnglish: b"
        );
        row.text = Some("custom".into());
        assert_eq!(PromptTemplate::Direct.training_text(&row), "custom");
    }

    #[test]
    fn test_llama3_chat_template() {
        let chat = ChatTemplate::new(ChatTemplateKind::Llama3);
        assert_eq!(
            chat.apply("\nhello"),
            "<|begin_of_text|><|start_header_id|>user<|end_header_id|>\n\nhello<|eot_id|><|start_header_id|>assistant<|end_header_id|>\n\n"
        );
        assert_eq!(chat.stop_tokens(), &[LLAMA3_EOT]);

        let plain = ChatTemplate::new(ChatTemplateKind::Plain);
        assert_eq!(plain.apply("\nhello"), "\nhello");
        assert!(plain.stop_tokens().is_empty());
    }

    #[test]
    fn test_eval_set_alignment() {
        let rows = rows();
        let builder = PromptBuilder::new(PromptTemplate::Direct, &rows[..1]);
        let set = EvalSet::build(&builder, &ChatTemplate::new(ChatTemplateKind::Plain), &rows[1..]);
        assert_eq!(set.len(), 2);
        assert_eq!(set.references, vec![vec!["Review the old".to_string()], vec!["A friend comes".to_string()]]);
        assert!(set.prompts[1].ends_with("Classical: 有朋自遠方來\nEnglish:"));
    }
}
