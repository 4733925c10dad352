use url::Url;

use crate::error::AppError;

const DETAIL_PREFIX: &str = "/job_detail/";
const DETAIL_SUFFIX: &str = ".html";

/// Identifiers extracted from a job detail link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLink {
    pub job_id: String,
    pub list_id: String,
    pub security_token: String,
}

impl JobLink {
    /// Parse `/job_detail/<jobId>.html?lid=<lid>&securityId=<sid>`.
    ///
    /// Accepts absolute URLs and site-relative paths. Extra query parameters
    /// are ignored; a missing `lid` or `securityId` is an error.
    pub fn parse(link: &str) -> Result<Self, AppError> {
        let base = Url::parse("https://placeholder.invalid/").map_err(|e| {
            AppError::InvalidJobLink(format!("{link}: {e}"))
        })?;
        let url = base
            .join(link.trim())
            .map_err(|e| AppError::InvalidJobLink(format!("{link}: {e}")))?;

        let job_id = url
            .path()
            .find(DETAIL_PREFIX)
            .map(|idx| &url.path()[idx + DETAIL_PREFIX.len()..])
            .and_then(|rest| rest.strip_suffix(DETAIL_SUFFIX))
            .filter(|id| !id.is_empty() && !id.contains('/'))
            .ok_or_else(|| AppError::InvalidJobLink(format!("{link}: not a job detail path")))?
            .to_string();

        let mut list_id = None;
        let mut security_token = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "lid" if !value.is_empty() => list_id = Some(value.into_owned()),
                "securityId" if !value.is_empty() => security_token = Some(value.into_owned()),
                _ => {}
            }
        }

        let list_id =
            list_id.ok_or_else(|| AppError::InvalidJobLink(format!("{link}: missing lid")))?;
        let security_token = security_token
            .ok_or_else(|| AppError::InvalidJobLink(format!("{link}: missing securityId")))?;

        Ok(Self {
            job_id,
            list_id,
            security_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_relative_link() {
        let link = JobLink::parse("/job_detail/abc123.html?lid=L9&securityId=S~x").unwrap();
        assert_eq!(link.job_id, "abc123");
        assert_eq!(link.list_id, "L9");
        assert_eq!(link.security_token, "S~x");
    }

    #[test]
    fn test_parse_absolute_link_with_extra_params() {
        let link = JobLink::parse(
            "https://www.zhipin.com/job_detail/f00.html?lid=abc.search.1&securityId=tok&sessionId=",
        )
        .unwrap();
        assert_eq!(link.job_id, "f00");
        assert_eq!(link.list_id, "abc.search.1");
        assert_eq!(link.security_token, "tok");
    }

    #[test]
    fn test_missing_security_id_fails() {
        let err = JobLink::parse("/job_detail/abc.html?lid=L9").unwrap_err();
        assert!(matches!(err, AppError::InvalidJobLink(_)));
        assert!(err.to_string().contains("securityId"));
    }

    #[test]
    fn test_non_detail_path_fails() {
        assert!(JobLink::parse("/web/geek/job?query=rust").is_err());
        assert!(JobLink::parse("/job_detail/.html?lid=a&securityId=b").is_err());
    }
}
