//! Code-generation prompt.
//!
//! The generated program is opaque to the pipeline. The contract it must
//! follow is stated here and nowhere else:
//! - the dataset path arrives as the first command-line argument
//! - charts go to `$ARTIFACT_DIR/chart_<n>.png`, `<n>` being the 1-based analysis number
//! - one JSON object is printed to stdout, each analysis under `analysis_<n>`
//! - a failing analysis reports `{"error": "..."}` and the script carries on

use super::{to_pretty_json, Prompt};
use crate::pipeline::documents::AnalysisPlan;
use crate::profile::{DatasetFormat, DatasetProfile};

const CODEGEN_SYSTEM_PROMPT: &str = "You are an expert Python data analyst. \
You write complete, defensive, headless analysis scripts.";

/// Build the code-generation prompt.
pub fn build_codegen_prompt(
    profile: &DatasetProfile,
    plan: &AnalysisPlan,
    format: DatasetFormat,
) -> Prompt {
    let loader = match format {
        DatasetFormat::Csv => "pd.read_csv(sys.argv[1])",
        DatasetFormat::Parquet => "pd.read_parquet(sys.argv[1])",
        DatasetFormat::Json => "pd.read_json(sys.argv[1])",
        DatasetFormat::JsonLines => "pd.read_json(sys.argv[1], lines=True)",
    };
    let keys = (1..=plan.analyses.len())
        .map(|n| format!("\"analysis_{n}\""))
        .collect::<Vec<_>>()
        .join(", ");

    let user = format!(
        r#"Write a complete, runnable Python script that performs the analysis plan below.

Rules:
- Load the dataset with `{loader}`. The path is always the first argument.
- Use only pandas, numpy, matplotlib, seaborn and the standard library.
- Call `matplotlib.use("Agg")` before importing pyplot. Never call plt.show().
- Save every chart into the directory named by the ARTIFACT_DIR environment
  variable: `os.path.join(os.environ.get("ARTIFACT_DIR", "."), "chart_<n>.png")`,
  where <n> is the 1-based number of the analysis in the plan. No other file names.
- Close every figure with plt.close() after saving it.
- Apply the cleaning steps first. Handle missing values before string operations
  and convert text to numbers with pd.to_numeric(..., errors="coerce").
- Wrap EACH analysis in its own try/except. On failure write the error to stderr
  and record {{"error": "<message>"}} for that analysis, then continue.
- At the very end print exactly one JSON object to stdout and nothing else on
  stdout. Its keys are {keys}; each value holds the key numbers of that analysis.
  Convert numpy and pandas values to plain Python types (use default=str).

Data profile:
{profile}

Analysis plan:
{plan}

Return ONLY the Python code, without Markdown fences or explanations."#,
        loader = loader,
        keys = keys,
        profile = to_pretty_json(profile),
        plan = to_pretty_json(plan),
    );

    Prompt::new(CODEGEN_SYSTEM_PROMPT, user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::documents::PlannedAnalysis;

    fn plan(n: usize) -> AnalysisPlan {
        AnalysisPlan {
            dataset_description: "d".to_string(),
            cleaning_steps: Vec::new(),
            analyses: (0..n)
                .map(|i| PlannedAnalysis {
                    question: format!("q{i}"),
                    columns: vec!["a".to_string()],
                    analysis_type: None,
                    chart_type: "bar".to_string(),
                    insight_hint: None,
                })
                .collect(),
        }
    }

    fn profile() -> DatasetProfile {
        DatasetProfile {
            filename: "data.parquet".to_string(),
            row_count: 1,
            column_count: 1,
            columns: Vec::new(),
            sample_rows: Vec::new(),
        }
    }

    #[test]
    fn test_codegen_prompt_lists_result_keys() {
        let prompt = build_codegen_prompt(&profile(), &plan(3), DatasetFormat::Csv);
        assert!(prompt
            .user
            .contains(r#""analysis_1", "analysis_2", "analysis_3""#));
        assert!(prompt.user.contains("ARTIFACT_DIR"));
        assert!(prompt.user.contains("pd.read_csv(sys.argv[1])"));
    }

    #[test]
    fn test_codegen_prompt_parquet_loader() {
        let prompt = build_codegen_prompt(&profile(), &plan(1), DatasetFormat::Parquet);
        assert!(prompt.user.contains("pd.read_parquet(sys.argv[1])"));
    }

    #[test]
    fn test_codegen_prompt_json_loaders() {
        let prompt = build_codegen_prompt(&profile(), &plan(1), DatasetFormat::Json);
        assert!(prompt.user.contains("pd.read_json(sys.argv[1])"));

        let prompt = build_codegen_prompt(&profile(), &plan(1), DatasetFormat::JsonLines);
        assert!(prompt.user.contains("pd.read_json(sys.argv[1], lines=True)"));
    }
}
