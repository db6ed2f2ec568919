use serde_json::{Map, Value, json};

use super::{
    DEFAULT_INTERVAL, DEFAULT_LOG_LIMIT, DEFAULT_TERMS_SIZE, EsQuery, Flavor, GroupBy,
    GroupByCate, MetricAggr,
};
use crate::datasource::{DatasourceError, DsResult};

/// Aggregation name a grouping is registered under, and read back with.
pub fn group_name(group: &GroupBy) -> &str {
    if !group.field.is_empty() {
        return &group.field;
    }
    match group.cate {
        GroupByCate::Terms => "terms",
        GroupByCate::Histogram => "histogram",
        GroupByCate::Filters => "filters",
    }
}

fn object(key: &str, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    Value::Object(map)
}

fn range_clause(date_field: &str, start: i64, end: i64) -> Value {
    object(
        "range",
        object(
            date_field,
            json!({
                "gte": start * 1000,
                "lte": end * 1000,
                "format": "epoch_millis",
            }),
        ),
    )
}

/// Lucene syntax goes through `query_string`, anything else is a lenient phrase match.
pub fn query_clause(filter: &str, range: Value) -> Value {
    let filter = filter.trim();
    if filter.is_empty() {
        return json!({"bool": {"should": [range]}});
    }
    if [":", "AND", "OR", "NOT"].iter().any(|token| filter.contains(token)) {
        json!({"bool": {"must": [{"query_string": {"query": filter}}], "filter": [range]}})
    } else {
        json!({
            "bool": {
                "filter": [
                    {"multi_match": {"query": filter, "lenient": true, "type": "phrase"}},
                    range,
                ]
            }
        })
    }
}

pub fn metric_aggregation(aggr: &MetricAggr) -> DsResult<Value> {
    let field = json!({"field": aggr.field});
    let percentiles = |percent: u32| {
        json!({"percentiles": {"field": aggr.field, "percents": [percent]}})
    };
    Ok(match aggr.func.as_str() {
        func @ ("avg" | "max" | "min" | "sum") => object(func, field),
        "count" => object("value_count", field),
        "p90" => percentiles(90),
        "p95" => percentiles(95),
        "p99" => percentiles(99),
        "median" => percentiles(50),
        other => {
            return Err(DatasourceError::query(format!("func {} not support", other)));
        }
    })
}

fn group_aggregation(group: &GroupBy, inner: Option<(String, Value)>) -> Value {
    let mut aggregation = match group.cate {
        GroupByCate::Terms => {
            let order_key = if group.order_by.is_empty() {
                "_key"
            } else {
                group.order_by.as_str()
            };
            let direction = if group.order.eq_ignore_ascii_case("asc") {
                "asc"
            } else {
                "desc"
            };
            json!({
                "terms": {
                    "field": group.field,
                    "size": if group.size > 0 { group.size } else { DEFAULT_TERMS_SIZE },
                    "min_doc_count": if group.min_doc_count > 0 { group.min_doc_count } else { 1 },
                    "order": object(order_key, Value::from(direction)),
                }
            })
        }
        GroupByCate::Histogram => json!({
            "histogram": {"field": group.field, "interval": group.interval.max(1)}
        }),
        GroupByCate::Filters => {
            let filters: Map<String, Value> = group
                .params
                .iter()
                .map(|param| {
                    let name = if param.alias.is_empty() {
                        param.query.clone()
                    } else {
                        param.alias.clone()
                    };
                    (name, json!({"query_string": {"query": param.query}}))
                })
                .collect();
            json!({"filters": {"filters": filters}})
        }
    };
    if let Some((name, sub)) = inner {
        aggregation["aggs"] = object(&name, sub);
    }
    aggregation
}

/// Search body of a bucketed time-series query.
///
/// `group_by[0]` is the innermost grouping; the metric sits below it.
pub fn build_ts_search(query: &EsQuery, flavor: Flavor, now: i64) -> DsResult<Value> {
    let interval = if query.interval > 0 {
        query.interval
    } else {
        DEFAULT_INTERVAL
    };
    let (start, end) = query.window(interval, now);
    let date_field = query.date_field();

    let metric = metric_aggregation(&query.metric_aggr)?;
    let mut inner = if query.metric_aggr.func == "count" {
        None
    } else {
        Some((query.metric_aggr.field.clone(), metric))
    };
    for group in &query.group_by {
        let aggregation = group_aggregation(group, inner.take());
        inner = Some((group_name(group).to_string(), aggregation));
    }

    let mut histogram = Map::new();
    histogram.insert("field".to_string(), Value::from(date_field));
    histogram.insert("min_doc_count".to_string(), Value::from(1));
    histogram.insert(
        flavor.histogram_interval_key().to_string(),
        Value::from(format!("{}s", interval)),
    );
    let mut ts = object("date_histogram", Value::Object(histogram));
    if let Some((name, aggregation)) = inner {
        ts["aggs"] = object(&name, aggregation);
    }

    Ok(json!({
        "size": 0,
        "query": query_clause(&query.filter, range_clause(date_field, start, end)),
        "aggs": {"ts": ts},
    }))
}

/// Search body of a paged log query.
pub fn build_log_search(query: &EsQuery, now: i64) -> Value {
    let (start, end) = query.window(query.interval, now);
    let date_field = query.date_field();
    let limit = if query.limit > 0 {
        query.limit
    } else {
        DEFAULT_LOG_LIMIT
    };
    let order = if query.ascending { "asc" } else { "desc" };

    json!({
        "track_total_hits": true,
        "query": query_clause(&query.filter, range_clause(date_field, start, end)),
        "from": query.page.max(0),
        "size": limit,
        "sort": [object(date_field, json!({"order": order}))],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eslike::FilterParam;

    fn ts_query(func: &str, group_by: Vec<GroupBy>) -> EsQuery {
        EsQuery {
            index: "logs".to_string(),
            metric_aggr: MetricAggr {
                field: "latency".to_string(),
                func: func.to_string(),
            },
            group_by,
            start: 1700000000,
            end: 1700000600,
            ..Default::default()
        }
    }

    #[test]
    fn test_filter_kinds() {
        let range = json!({"range": {}});
        assert!(query_clause("", range.clone())["bool"]["should"].is_array());
        let clause = query_clause("status:500", range.clone());
        assert!(clause["bool"]["must"][0]["query_string"].is_object());
        assert_eq!(
            query_clause("timeout error", range)["bool"]["filter"][0]["multi_match"]["type"],
            "phrase"
        );
    }

    #[test]
    fn test_count_with_terms() {
        let group = GroupBy {
            field: "host".to_string(),
            ..Default::default()
        };
        let body = build_ts_search(&ts_query("count", vec![group]), Flavor::Es7, 0).unwrap();
        let ts = &body["aggs"]["ts"];
        assert_eq!(ts["date_histogram"]["fixed_interval"], "60s");
        assert_eq!(ts["date_histogram"]["field"], "@timestamp");
        let terms = &ts["aggs"]["host"]["terms"];
        assert_eq!(terms["size"], 300);
        assert_eq!(terms["min_doc_count"], 1);
        assert_eq!(terms["order"]["_key"], "desc");
        assert!(ts["aggs"]["host"].get("aggs").is_none());

        let range = &body["query"]["bool"]["should"][0]["range"]["@timestamp"];
        assert_eq!(range["gte"], 1699999980000i64);
        assert_eq!(range["lte"], 1700000580000i64);
    }

    #[test]
    fn test_nested_groups_and_percentiles() {
        let groups = vec![
            GroupBy {
                field: "path".to_string(),
                ..Default::default()
            },
            GroupBy {
                cate: GroupByCate::Filters,
                params: vec![FilterParam {
                    alias: "slow".to_string(),
                    query: "latency:>100".to_string(),
                }],
                ..Default::default()
            },
        ];
        let body = build_ts_search(&ts_query("p99", groups), Flavor::Es6, 0).unwrap();
        let ts = &body["aggs"]["ts"];
        assert_eq!(ts["date_histogram"]["interval"], "60s");
        let filters = &ts["aggs"]["filters"];
        assert_eq!(
            filters["filters"]["filters"]["slow"]["query_string"]["query"],
            "latency:>100"
        );
        let leaf = &filters["aggs"]["path"]["aggs"]["latency"]["percentiles"];
        assert_eq!(leaf["percents"][0], 99);
    }

    #[test]
    fn test_unknown_func() {
        assert!(build_ts_search(&ts_query("mode", vec![]), Flavor::Es7, 0).is_err());
    }

    #[test]
    fn test_log_search() {
        let query = EsQuery {
            filter: "oops".to_string(),
            page: 20,
            ascending: true,
            start: 100,
            end: 200,
            ..Default::default()
        };
        let body = build_log_search(&query, 0);
        assert_eq!(body["size"], 10);
        assert_eq!(body["from"], 20);
        assert_eq!(body["sort"][0]["@timestamp"]["order"], "asc");
        assert_eq!(body["track_total_hits"], true);
    }
}
