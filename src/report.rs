//! HTML report assembly
//!
//! A report is a title and a list of sections; each section holds prose,
//! preformatted model output, tables and inline SVG figures. All text is
//! escaped on render; figures are trusted markup from [`crate::svg`].

use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use crate::svg::escape_xml;
use crate::Result;

#[derive(Debug, Clone)]
enum Block {
    Paragraph(String),
    Preformatted(String),
    Figure { svg: String, caption: String },
    Table { header: Vec<String>, rows: Vec<Vec<String>> },
    Note(String),
}

#[derive(Debug, Clone)]
pub struct Section {
    title: String,
    blocks: Vec<Block>,
}

impl Section {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            blocks: Vec::new(),
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Prose; blank lines separate paragraphs
    pub fn paragraph(&mut self, text: &str) -> &mut Self {
        for para in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
            self.blocks.push(Block::Paragraph(para.to_string()));
        }
        self
    }

    pub fn preformatted(&mut self, text: &str) -> &mut Self {
        self.blocks.push(Block::Preformatted(text.to_string()));
        self
    }

    pub fn figure(&mut self, svg: String, caption: &str) -> &mut Self {
        self.blocks.push(Block::Figure {
            svg,
            caption: caption.to_string(),
        });
        self
    }

    pub fn table(&mut self, header: Vec<String>, rows: Vec<Vec<String>>) -> &mut Self {
        self.blocks.push(Block::Table { header, rows });
        self
    }

    /// Highlighted remark, e.g. a convergence warning
    pub fn note(&mut self, text: &str) -> &mut Self {
        self.blocks.push(Block::Note(text.to_string()));
        self
    }

    pub fn figure_count(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| matches!(b, Block::Figure { .. }))
            .count()
    }
}

#[derive(Debug, Clone)]
pub struct Report {
    title: String,
    sections: Vec<Section>,
}

const STYLE: &str = "body{font-family:Georgia,serif;max-width:1000px;margin:2em auto;padding:0 1em;line-height:1.5;color:#222}\
h1,h2{font-family:sans-serif}\
pre{background:#f6f8fa;padding:0.8em;overflow-x:auto;font-size:0.85em}\
figure{margin:1.5em 0}\
figcaption{font-size:0.9em;color:#555}\
table{border-collapse:collapse;margin:1em 0}\
td,th{border:1px solid #ccc;padding:0.25em 0.6em;text-align:right}\
.note{border-left:4px solid #d62728;background:#fdf0f0;padding:0.5em 1em}";

impl Report {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            sections: Vec::new(),
        }
    }

    pub fn push(&mut self, section: Section) {
        self.sections.push(section);
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn figure_count(&self) -> usize {
        self.sections.iter().map(Section::figure_count).sum()
    }

    pub fn render(&self) -> String {
        let mut html = String::new();
        let _ = write!(
            html,
            "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n<title>{}</title>\n<style>{}</style>\n</head>\n<body>\n<h1>{}</h1>\n",
            escape_xml(&self.title),
            STYLE,
            escape_xml(&self.title)
        );

        for (i, section) in self.sections.iter().enumerate() {
            let _ = writeln!(
                html,
                "<section id=\"section-{}\">\n<h2>{}</h2>",
                i + 1,
                escape_xml(&section.title)
            );
            for block in &section.blocks {
                match block {
                    Block::Paragraph(text) => {
                        let _ = writeln!(html, "<p>{}</p>", escape_xml(text));
                    }
                    Block::Preformatted(text) => {
                        let _ = writeln!(html, "<pre>{}</pre>", escape_xml(text));
                    }
                    Block::Figure { svg, caption } => {
                        let _ = writeln!(
                            html,
                            "<figure>\n{}\n<figcaption>{}</figcaption>\n</figure>",
                            svg,
                            escape_xml(caption)
                        );
                    }
                    Block::Table { header, rows } => {
                        html.push_str("<table>\n<tr>");
                        for h in header {
                            let _ = write!(html, "<th>{}</th>", escape_xml(h));
                        }
                        html.push_str("</tr>\n");
                        for row in rows {
                            html.push_str("<tr>");
                            for cell in row {
                                let _ = write!(html, "<td>{}</td>", escape_xml(cell));
                            }
                            html.push_str("</tr>\n");
                        }
                        html.push_str("</table>\n");
                    }
                    Block::Note(text) => {
                        let _ = writeln!(html, "<p class=\"note\">{}</p>", escape_xml(text));
                    }
                }
            }
            html.push_str("</section>\n");
        }

        html.push_str("</body>\n</html>\n");
        html
    }

    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.render())?;
        Ok(())
    }
}
