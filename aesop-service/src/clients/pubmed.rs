use std::time::Duration;

use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::models::Paper;

const PUBMED_TIMEOUT: Duration = Duration::from_secs(10);

/// Bibliographic search backend. Search returns identifiers; fetch returns
/// abstract records. Both may fail; callers are expected to tolerate partial
/// results.
#[async_trait]
pub trait PubMed: Send + Sync {
    async fn search(&self, query: &str, retmax: usize) -> anyhow::Result<Vec<String>>;
    async fn fetch(&self, pmids: &[String]) -> anyhow::Result<Vec<Paper>>;
}

/// NCBI eutils client (esearch + efetch).
pub struct HttpPubMedClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpPubMedClient {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(PUBMED_TIMEOUT)
            .build()
            .context("failed to build PubMed HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl PubMed for HttpPubMedClient {
    async fn search(&self, query: &str, retmax: usize) -> anyhow::Result<Vec<String>> {
        let url = format!(
            "{}/esearch.fcgi?db=pubmed&term={}&retmode=json&retmax={}",
            self.base_url,
            urlencoding::encode(query),
            retmax
        );

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("PubMed search request failed")?;
        let data: Value = response
            .json()
            .await
            .context("failed to parse PubMed search response")?;

        let pmids = data["esearchresult"]["idlist"]
            .as_array()
            .ok_or_else(|| anyhow!("PubMed search response missing idlist"))?
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect::<Vec<_>>();

        info!(query = %query, found = pmids.len(), "PubMed search completed");
        Ok(pmids)
    }

    async fn fetch(&self, pmids: &[String]) -> anyhow::Result<Vec<Paper>> {
        if pmids.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!(
            "{}/efetch.fcgi?db=pubmed&id={}&retmode=xml",
            self.base_url,
            pmids.join(",")
        );

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("PubMed fetch request failed")?;
        let xml = response
            .text()
            .await
            .context("failed to read PubMed fetch response")?;

        Ok(parse_pubmed_xml(&xml))
    }
}

/// Pull papers out of efetch XML.
///
/// The eutils payload is stable enough that targeted tag extraction holds up;
/// records missing a PMID or title are skipped rather than failing the batch.
pub fn parse_pubmed_xml(xml: &str) -> Vec<Paper> {
    let mut papers = Vec::new();

    for section in xml.split("<PubmedArticle>").skip(1) {
        let Some(pmid) = extract_xml_value(section, "PMID") else {
            continue;
        };
        let Some(title) = extract_xml_value(section, "ArticleTitle") else {
            continue;
        };

        let abstract_text = extract_all_xml_values(section, "AbstractText").join(" ");
        let journal = extract_xml_value(section, "Title");
        let publication_year = section
            .find("<PubDate>")
            .and_then(|at| extract_xml_value(&section[at..], "Year"))
            .and_then(|y| y.parse::<i32>().ok());

        papers.push(Paper {
            pmid,
            title,
            abstract_text,
            publication_year,
            journal,
        });
    }

    papers
}

/// Extract the text content of the first `<tag …>…</tag>` occurrence.
/// Tolerates attributes on the opening tag.
fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let (content, _) = extract_from(xml, tag, 0)?;
    Some(content)
}

/// Collect every occurrence of a tag (e.g. structured abstracts split across
/// several `<AbstractText Label="…">` segments).
fn extract_all_xml_values(xml: &str, tag: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut cursor = 0;
    while let Some((content, next)) = extract_from(xml, tag, cursor) {
        values.push(content);
        cursor = next;
    }
    values
}

fn extract_from(xml: &str, tag: &str, from: usize) -> Option<(String, usize)> {
    let open = format!("<{tag}");
    let close = format!("</{tag}>");

    let start = xml[from..].find(&open)? + from;
    let content_start = xml[start..].find('>')? + start + 1;
    let end = xml[content_start..].find(&close)? + content_start;

    let content = xml[content_start..end].trim().to_string();
    Some((content, end + close.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<PubmedArticleSet>
<PubmedArticle>
  <MedlineCitation>
    <PMID Version="1">11111111</PMID>
    <Article>
      <Journal><Title>Diabetes Care</Title><JournalIssue><PubDate><Year>2021</Year></PubDate></JournalIssue></Journal>
      <ArticleTitle>Metformin outcomes in type 2 diabetes</ArticleTitle>
      <Abstract>
        <AbstractText Label="BACKGROUND">Large cohort examined.</AbstractText>
        <AbstractText Label="RESULTS">HbA1c improved.</AbstractText>
      </Abstract>
    </Article>
  </MedlineCitation>
</PubmedArticle>
<PubmedArticle>
  <MedlineCitation>
    <PMID Version="1">22222222</PMID>
    <Article>
      <ArticleTitle>Untitled abstractless record</ArticleTitle>
    </Article>
  </MedlineCitation>
</PubmedArticle>
</PubmedArticleSet>"#;

    #[test]
    fn parses_pmid_title_and_joined_abstract() {
        let papers = parse_pubmed_xml(SAMPLE);
        assert_eq!(papers.len(), 2);

        let first = &papers[0];
        assert_eq!(first.pmid, "11111111");
        assert_eq!(first.title, "Metformin outcomes in type 2 diabetes");
        assert_eq!(first.abstract_text, "Large cohort examined. HbA1c improved.");
        assert_eq!(first.journal.as_deref(), Some("Diabetes Care"));
        assert_eq!(first.publication_year, Some(2021));
    }

    #[test]
    fn missing_fields_degrade_to_defaults() {
        let papers = parse_pubmed_xml(SAMPLE);
        let second = &papers[1];
        assert_eq!(second.pmid, "22222222");
        assert!(second.abstract_text.is_empty());
        assert_eq!(second.publication_year, None);
    }

    #[test]
    fn garbage_xml_yields_no_papers() {
        assert!(parse_pubmed_xml("not xml at all").is_empty());
        assert!(parse_pubmed_xml("<PubmedArticle><PMID>1</PMID>").is_empty());
    }
}
