use rust_htslib::bam;

pub struct ChromInfo {
    pub label: String,
    pub length: u64,
}

/// Chromosome names and sizes, indexed by the chromosome (target) ids of the alignment file
///
#[derive(Default)]
pub struct ChromList {
    pub data: Vec<ChromInfo>,
}

impl ChromList {
    pub fn from_bam_header(header: &bam::HeaderView) -> Self {
        let data = (0..header.target_count())
            .map(|tid| ChromInfo {
                label: String::from_utf8_lossy(header.tid2name(tid)).to_string(),
                length: header.target_len(tid).unwrap_or(0),
            })
            .collect();
        Self { data }
    }

    pub fn total_length(&self) -> u64 {
        self.data.iter().map(|x| x.length).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_htslib::bam::{Header, HeaderView, header};

    #[test]
    fn test_from_bam_header() {
        let mut _header = Header::new();
        _header.push_record(
            header::HeaderRecord::new(b"SQ")
                .push_tag(b"SN", "chr1")
                .push_tag(b"LN", 1000),
        );
        _header.push_record(
            header::HeaderRecord::new(b"SQ")
                .push_tag(b"SN", "chr2")
                .push_tag(b"LN", 250),
        );
        let header = HeaderView::from_header(&_header);

        let chrom_list = ChromList::from_bam_header(&header);
        assert_eq!(chrom_list.data.len(), 2);
        assert_eq!(chrom_list.data[1].label, "chr2");
        assert_eq!(chrom_list.data[1].length, 250);
        assert_eq!(chrom_list.total_length(), 1250);
    }
}
