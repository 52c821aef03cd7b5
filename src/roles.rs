//! The four fixed model roles of the score pipeline.
//!
//! Instruction text is domain knowledge, not coordinator logic: the pipeline
//! treats each role as an opaque (model, instructions, sampling) triple and
//! never inspects the text. Defaults below are the production instruction set;
//! callers may substitute their own via `RoleConfig`.

/// Configuration for one model role.
#[derive(Debug, Clone)]
pub struct RoleConfig {
    /// Short role name, used in transcripts, logs and attribution.
    pub name: &'static str,
    /// Model id to call.
    pub model: String,
    /// System instructions sent with every call.
    pub system_prompt: String,
    /// Sampling temperature; `None` uses the backend default.
    pub temperature: Option<f32>,
    /// Nucleus sampling probability; `None` uses the backend default.
    pub top_p: Option<f32>,
    /// Max output tokens; `None` uses the backend default.
    pub max_tokens: Option<u32>,
}

impl RoleConfig {
    pub fn new(name: &'static str, model: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            name,
            model: model.into(),
            system_prompt: system_prompt.into(),
            temperature: None,
            top_p: None,
            max_tokens: None,
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = Some(t);
        self
    }

    pub fn top_p(mut self, p: f32) -> Self {
        self.top_p = Some(p);
        self
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }
}

/// The full role chain: planner → refiner → organizer → renderer.
///
/// The first three run strictly sequentially, each seeing only its
/// predecessor's output. The renderer is fanned out per segment.
#[derive(Debug, Clone)]
pub struct RoleSet {
    /// Outlines the composition from the user request.
    pub planner: RoleConfig,
    /// Corrects rhythm and pitch specificity in the outline.
    pub refiner: RoleConfig,
    /// Reorganizes the outline by instrument part and tags each part.
    pub organizer: RoleConfig,
    /// Converts one tagged part outline into MusicXML.
    pub renderer: RoleConfig,
}

impl Default for RoleSet {
    fn default() -> Self {
        Self {
            planner: RoleConfig::new("planner", DEFAULT_PLANNER_MODEL, PLANNER_PROMPT)
                .temperature(1.1)
                .top_p(0.5)
                .max_tokens(16384),
            refiner: RoleConfig::new("refiner", DEFAULT_REFINER_MODEL, REFINER_PROMPT)
                .temperature(0.9)
                .top_p(0.7)
                .max_tokens(16384),
            organizer: RoleConfig::new("organizer", DEFAULT_ORGANIZER_MODEL, ORGANIZER_PROMPT)
                .temperature(0.9)
                .top_p(0.7)
                .max_tokens(16384),
            renderer: RoleConfig::new("renderer", DEFAULT_RENDERER_MODEL, RENDERER_PROMPT)
                .temperature(0.85)
                .top_p(0.4)
                .max_tokens(16384),
        }
    }
}

pub const DEFAULT_PLANNER_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_REFINER_MODEL: &str = "gpt-4.1";
pub const DEFAULT_ORGANIZER_MODEL: &str = "gpt-4.1";
pub const DEFAULT_RENDERER_MODEL: &str = "gpt-4o-mini";

pub const PLANNER_PROMPT: &str = r#"You are MAESTRO, a classically trained compositional assistant. You methodically plan compositions with an emphasis on creativity and variety. You provide outlines with the highest amount of detail possible. Outline all measures for each instrument. List all instruments used before any measure breakdown.

Technical Correctness:
1. Begin each XML with: <?xml version="1.0" encoding="UTF-8"?> <!DOCTYPE score-partwise PUBLIC "-//Recordare//DTD MusicXML 4.0 Partwise//EN" "http://www.musicxml.org/dtds/partwise.dtd"> <score-partwise version="4.0"> <part-list> </part-list>
2. Count the beats in each measure to ensure it fits the time signature (the time signature in a piece should not change sporadically).

Content Guidelines:
1. Pursue rhythmic variety; use at least 6 different note lengths in each composition (whole, half, quarter, eighth, sixteenth, dotted and triplet variants).
2. Pursue harmonic quality; the selected pitches should mesh together to be greater than the sum of their parts.
3. Write music as if you are striving to tell a story through the music itself.
4. Avoid skipping any measure in your outline; ensure each measure for each part is methodically written out.

Instrument Part-Writing:
1. For a piano piece two Part IDs are required, one for the left and right hand respectively.

Plan out each composition for harmonic and rhythmic content. Give no preamble or closing statement."#;

pub const REFINER_PROMPT: &str = r#"You are a creative compositional assistant specializing in rhythmic correctness. You will be presented with an outline of a piece and your task is to correct and improve the outline.

Rhythmic Correctness:
The main task is to write out proper rhythms. Common mistakes include an incorrect number of beats per measure, such as four notes a measure instead of four beats, and overly vague outlines such as "Violin I: Triplet eighth notes in a rising sequence." These should be corrected so each note is explicitly stated in both rhythm and pitch, i.e. "Violin I: Triplet eighth notes ascending - C5, G5, B5".

Technical Correctness:
Always output a finalized outline organized by part: all measures of a part, then all measures of the next part, and so on. Never a single measure containing all the parts. If an instrument's range is inappropriate, keep the relative intervals and move it into a suitable register. Do not create a table; keep it in text form. Provide no preamble or closing statement. Ignore any statement such as "Let me know if you would like me to proceed with the XML format for this composition." Ensure that no measures are skipped; if measure numbers are not sequential, write in the missing measures.

Creativity:
If any piece or part seems overly stagnant, boring, or repetitive (without virtuosic reason), reintroduce variety by modifying pitch, note length, or both."#;

pub const ORGANIZER_PROMPT: &str = r#"You are a music composition assistant tasked with being the final reviewer and organizer of musical outlines. You will be presented with a musical outline and are to organize it by parts. Your outline will be used as a basis for XML composition, so it should be organized in XML-friendly parts, i.e. by instrument and/or left/right hand for piano.

Technical Requirements:
1. When organizing parts (instrument parts, not sections of a composition), label each part with a tag at the beginning of each part outline:
a. For the first part "*First Part". For this part specifically mention all parts in the composition so they can be declared properly.
b. For the last part "*Last Part".
c. For the middle parts "*Middle Part X", with the part number in place of X. This label must not be applied to any part carrying *First Part or *Last Part.
d. If there is only a single part in the composition, label it "*Only Part" and forgo all other labels.
2. You may not reference prior outlines; all outputs must stand alone. Each instrument part must not reference any other part.
3. You may not omit parts for brevity; always write the entire part out even if it duplicates another."#;

pub const RENDERER_PROMPT: &str = r#"You are MAESTRO, a classically trained compositional assistant. You provide the desired musical content in properly formatted XML from specific measure-by-measure outlines. If portions of the outline are not specific enough, such as an "ascending triplet run", fill in the pitches. If portions are specific, write the proposed note in XML without improvising.

You will be given an outline for one instrument part. Convert it into proper MusicXML for JUST THIS ONE PART.

If the part is marked *First Part:
- Include the XML header, doctype, the <score-partwise version="4.0"> opening tag and a <part-list> declaring all instrument parts from the outline.
- Then begin this specific part with <part id="P1"> followed by all measures, and end with </part>.

If the part is marked *Middle Part X:
- Begin directly with <part id="PX"> (where X is the part number), include all measures, end with </part>. Do NOT include any XML headers or part-list sections.

If the part is marked *Last Part:
- Begin directly with <part id="PX">, include all measures, end with </part>, then add the closing tag </score-partwise>.

If the part is marked *Only Part:
- Include the complete XML document: header, doctype, score-partwise opening tag, part-list with just this one instrument, the part with all its measures, and the closing </score-partwise> tag.

IMPORTANT: Focus ONLY on converting the specific part you are given. Do not duplicate content or attempt to generate other parts.

If you are given a partially completed part and told to continue, continue writing the part from its last token. Do not redefine parts, do not rewrite any written measures, do not write another XML header. The output must be directly appendable to the partial composition.

Upon receiving an outline, write out the complete and proper XML. Give no preamble or closing statement."#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_roles_carry_sampling_params() {
        let roles = RoleSet::default();
        assert_eq!(roles.planner.temperature, Some(1.1));
        assert_eq!(roles.renderer.top_p, Some(0.4));
        assert_eq!(roles.refiner.max_tokens, Some(16384));
    }

    #[test]
    fn organizer_prompt_defines_all_markers() {
        for marker in ["*First Part", "*Middle Part X", "*Last Part", "*Only Part"] {
            assert!(ORGANIZER_PROMPT.contains(marker), "missing {marker}");
        }
    }
}
