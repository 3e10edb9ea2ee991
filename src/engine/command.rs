use crate::error::ArgumentParseError;
use crate::model::JobRequest;
use std::path::Path;

/// Full invocation of the inference program: executable first, then arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CommandSpec {
    tokens: Vec<String>,
}

impl CommandSpec {
    /// Assemble the invocation for one job.
    ///
    /// Pure: the same inputs always produce the same tokens.
    pub fn build(
        program: &Path,
        program_args: &[String],
        request: &JobRequest,
        model_path: &Path,
        input_path: &Path,
    ) -> Result<Self, ArgumentParseError> {
        let extra = split_extra_args(&request.extra_args)?;

        let mut tokens = Vec::with_capacity(1 + program_args.len() + 8 + extra.len());
        tokens.push(program.to_string_lossy().into_owned());
        tokens.extend(program_args.iter().cloned());
        tokens.push("--model_type".into());
        tokens.push(request.model_type.clone());
        tokens.push("--model".into());
        tokens.push(model_path.to_string_lossy().into_owned());
        tokens.push("--input_map_path".into());
        tokens.push(input_path.to_string_lossy().into_owned());
        if request.unseen {
            tokens.push("--unseen".into());
        }
        if request.vectorization {
            tokens.push("--vectorization".into());
        }
        tokens.extend(extra);
        Ok(Self { tokens })
    }

    pub fn program(&self) -> &str {
        &self.tokens[0]
    }

    pub fn args(&self) -> &[String] {
        &self.tokens[1..]
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Shell-quoted rendering for the job log.
    pub fn display(&self) -> String {
        self.tokens()
            .iter()
            .map(|t| {
                shlex::try_quote(t)
                    .map(|q| q.into_owned())
                    .unwrap_or_else(|_| format!("{t:?}"))
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Split free-form arguments with POSIX shell quoting rules.
pub(crate) fn split_extra_args(input: &str) -> Result<Vec<String>, ArgumentParseError> {
    if input.trim().is_empty() {
        return Ok(Vec::new());
    }
    shlex::split(input).ok_or_else(|| ArgumentParseError {
        input: input.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelChoice;
    use std::path::PathBuf;

    fn request(extra: &str, unseen: bool, vectorization: bool) -> JobRequest {
        JobRequest {
            input_image: Some(PathBuf::from("/in/map.png")),
            model: ModelChoice::Preset("UNet (default)".into()),
            model_type: "unet".into(),
            unseen,
            vectorization,
            extra_args: extra.into(),
        }
    }

    fn build(req: &JobRequest) -> CommandSpec {
        CommandSpec::build(
            Path::new("python3"),
            &["-u".to_string(), "infer.py".to_string()],
            req,
            Path::new("/ws/unet.pth"),
            Path::new("/ws/map.png"),
        )
        .unwrap()
    }

    #[test]
    fn builds_tokens_in_contract_order() {
        let cmd = build(&request("--tile 512", true, true));
        assert_eq!(cmd.program(), "python3");
        assert_eq!(
            cmd.args(),
            [
                "-u",
                "infer.py",
                "--model_type",
                "unet",
                "--model",
                "/ws/unet.pth",
                "--input_map_path",
                "/ws/map.png",
                "--unseen",
                "--vectorization",
                "--tile",
                "512",
            ]
        );
    }

    #[test]
    fn false_flags_are_omitted() {
        let cmd = build(&request("", false, false));
        assert!(!cmd.tokens().iter().any(|t| t.starts_with("--unseen")));
        assert!(!cmd.tokens().iter().any(|t| t.starts_with("--vectorization")));
        assert_eq!(cmd.tokens().last().unwrap(), "/ws/map.png");
    }

    #[test]
    fn build_is_deterministic() {
        let req = request("--x 'a b'", true, false);
        assert_eq!(build(&req), build(&req));
    }

    #[test]
    fn extra_args_honor_shell_quoting() {
        assert_eq!(
            split_extra_args("--a 1 --b \"two words\"").unwrap(),
            ["--a", "1", "--b", "two words"]
        );
        assert!(split_extra_args("   ").unwrap().is_empty());
    }

    #[test]
    fn unbalanced_quotes_fail() {
        let err = split_extra_args("--name \"oops").unwrap_err();
        assert_eq!(err.input, "--name \"oops");
        let err = CommandSpec::build(
            Path::new("p"),
            &[],
            &request("'x", true, true),
            Path::new("m"),
            Path::new("i"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("unbalanced"));
    }

    #[test]
    fn display_round_trips_through_shell_split() {
        let cmd = build(&request("--title 'my map'", false, false));
        let shown = cmd.display();
        assert!(shown.contains("my map"));
        assert_eq!(shlex::split(&shown).unwrap(), cmd.tokens());
    }
}
